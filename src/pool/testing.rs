//! Scripted in-process guests for scheduler tests
//!
//! Each instance runs on its own thread like a real guest and answers by
//! method name:
//!
//! | method      | behaviour                                        |
//! |-------------|--------------------------------------------------|
//! | `echo`      | result is the params                             |
//! | `echo_slow` | same, after a short sleep                        |
//! | `fail`      | error envelope                                   |
//! | `stream`    | `params.count` intermediates, then `{"done": n}` |
//! | `garbage`   | a line that is not JSON                          |
//! | `hang`      | never answers                                    |
//! | `crash`     | closes its output and exits                      |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::channel::oneshot;
use futures::executor::block_on;
use serde_json::{json, Value};

use super::worker::{GuestInstance, GuestLauncher};
use crate::kernel::pipe::BytePipe;
use crate::kernel::wasm::{ExitStatus, HostError};

struct Inner {
    launched: AtomicUsize,
    disposed: AtomicUsize,
    requests: Mutex<Vec<String>>,
    not_ready: Option<String>,
}

#[derive(Clone)]
pub(crate) struct ScriptedLauncher {
    inner: Arc<Inner>,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> Self {
        Self::with_bootstrap(None)
    }

    /// Guests that announce `{"ready":false}` and exit
    pub(crate) fn not_ready(reason: &str) -> Self {
        Self::with_bootstrap(Some(reason.to_string()))
    }

    fn with_bootstrap(not_ready: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                launched: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                not_ready,
            }),
        }
    }

    pub(crate) fn launched(&self) -> usize {
        self.inner.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn disposed(&self) -> usize {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Requests in the order they were written to any instance; string
    /// params are recorded as-is, anything else by method name
    pub(crate) fn requests(&self) -> Vec<String> {
        self.inner.requests.lock().unwrap().clone()
    }
}

impl GuestLauncher for ScriptedLauncher {
    fn launch(&self) -> Result<GuestInstance, HostError> {
        self.inner.launched.fetch_add(1, Ordering::SeqCst);
        let stdin = BytePipe::new();
        let stdout = BytePipe::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        match &self.inner.not_ready {
            Some(reason) => {
                stdout.write(format!("{}\n", json!({"ready": false, "error": reason})).as_bytes());
                stdout.close();
                let _ = exit_tx.send(ExitStatus::Exited(1));
            }
            None => {
                stdout.write(b"{\"ready\":true}\n");
                let inner = self.inner.clone();
                stdin
                    .set_listener(Arc::new(move |bytes: &[u8]| {
                        let request: Value = serde_json::from_slice(bytes).unwrap();
                        let label = match request["params"].as_str() {
                            Some(label) => label.to_string(),
                            None => request["method"].as_str().unwrap_or_default().to_string(),
                        };
                        inner.requests.lock().unwrap().push(label);
                    }))
                    .unwrap();
                let (guest_in, guest_out) = (stdin.clone(), stdout.clone());
                thread::spawn(move || serve(guest_in, guest_out, exit_tx));
            }
        }

        let inner = self.inner.clone();
        let host_stdin = stdin.clone();
        let disposer = Box::new(move || {
            inner.disposed.fetch_add(1, Ordering::SeqCst);
            host_stdin.close();
        });
        Ok(GuestInstance::new(stdin, stdout, exit_rx, disposer))
    }
}

fn line(value: Value) -> Vec<u8> {
    format!("{}\n", value).into_bytes()
}

fn serve(stdin: BytePipe, stdout: BytePipe, exit: oneshot::Sender<ExitStatus>) {
    let status = loop {
        let Some(request) = block_on(stdin.read_line()) else {
            break ExitStatus::Exited(0);
        };
        let request: Value = serde_json::from_str(&request).unwrap();
        let id = request["id"].clone();
        let params = request["params"].clone();
        let result = |result: Value| line(json!({"jsonrpc": "2.0", "id": id, "result": result}));

        match request["method"].as_str().unwrap_or_default() {
            "echo" => stdout.write(&result(params)),
            "echo_slow" => {
                thread::sleep(Duration::from_millis(30));
                stdout.write(&result(params));
            }
            "fail" => stdout.write(&line(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"message": "requested failure"}
            }))),
            "stream" => {
                let count = params["count"].as_u64().unwrap_or(0);
                for n in 0..count {
                    stdout.write(&line(json!({"n": n})));
                }
                stdout.write(&result(json!({"done": count})));
            }
            "garbage" => stdout.write(b"not json\n"),
            "hang" => {}
            "crash" => break ExitStatus::Trapped("wasm trap: unreachable".to_string()),
            other => stdout.write(&line(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"message": format!("unknown method {}", other)}
            }))),
        }
    };
    stdout.close();
    let _ = exit.send(status);
}
