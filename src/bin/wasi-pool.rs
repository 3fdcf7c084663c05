//! wasi-pool - drive a guest pool by hand
//!
//! Reads one request per line from stdin:
//!
//! ```text
//! status
//! log {"limit": 5}
//! !priority 2 9
//! !cancel 2
//! !metrics
//! ```
//!
//! Plain lines are `method [json-params]` and print the job id they were
//! given. Results and stream messages go to stdout as JSON lines, failures
//! to stderr. Lines starting with `!` control jobs already submitted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::executor::LocalPool;
use futures::future::{RemoteHandle, join_all};
use futures::task::LocalSpawnExt;
use serde_json::{Value, json};

use wasi_pool::pool::{JobHandle, JobId, PARKED, Pool, Priority, StreamJob};
use wasi_pool::PoolConfig;

#[derive(Parser)]
#[command(name = "wasi-pool", version, about = "Run JSON-RPC requests against a pool of WASI guests")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Guest module (.wasm or .wat); overrides the config
    #[arg(short, long)]
    module: Option<PathBuf>,

    /// Host directory granted to every guest
    #[arg(long, conflicts_with = "zip")]
    root: Option<PathBuf>,

    /// Zip archive granted to every guest instead of a directory
    #[arg(long)]
    zip: Option<PathBuf>,

    /// Number of guest instances
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Priority given to submitted jobs
    #[arg(short, long, default_value_t = 1)]
    priority: Priority,

    /// Submit streaming jobs and print every intermediate message
    #[arg(long)]
    stream: bool,

    /// Log every syscall (needs RUST_LOG=trace)
    #[arg(long)]
    trace: bool,
}

fn load_config(args: &Args) -> Result<PoolConfig> {
    let mut config = match &args.config {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::default(),
    };
    if let Some(module) = &args.module {
        config.module = module.clone();
    }
    if let Some(root) = &args.root {
        config.root = Some(root.clone());
        config.zip = None;
    }
    if let Some(zip) = &args.zip {
        config.zip = Some(zip.clone());
        config.root = None;
    }
    if let Some(n) = args.concurrency {
        config.max_concurrency = n;
    }
    if args.trace {
        config.guest.trace_syscalls = true;
    }
    if config.module.as_os_str().is_empty() {
        bail!("no guest module given (use --module or a config file)");
    }
    config.validate()?;
    Ok(config)
}

/// One parsed input line
enum Command {
    Submit { method: String, params: Value },
    Priority { id: JobId, priority: Priority },
    Cancel { id: JobId },
    Metrics,
}

fn parse_line(line: &str) -> Result<Command> {
    if let Some(control) = line.strip_prefix('!') {
        let words: Vec<&str> = control.split_whitespace().collect();
        return match words.as_slice() {
            ["metrics"] => Ok(Command::Metrics),
            ["cancel", id] => Ok(Command::Cancel { id: id.parse()? }),
            ["priority", id, priority] => Ok(Command::Priority {
                id: id.parse()?,
                priority: priority.parse()?,
            }),
            _ => bail!("unknown control command: {}", line),
        };
    }

    let (method, params) = match line.split_once(char::is_whitespace) {
        Some((method, rest)) => {
            let params = serde_json::from_str(rest.trim()).context("params must be JSON")?;
            (method, params)
        }
        None => (line, Value::Null),
    };
    Ok(Command::Submit {
        method: method.to_string(),
        params,
    })
}

/// Jobs submitted from stdin that have not reported yet
#[derive(Default)]
struct Outstanding {
    jobs: HashMap<JobId, (JobHandle, Priority)>,
}

impl Outstanding {
    fn insert(&mut self, handle: JobHandle, priority: Priority) {
        self.jobs.insert(handle.id(), (handle, priority));
    }

    fn remove(&mut self, id: JobId) {
        self.jobs.remove(&id);
    }

    fn set_priority(&mut self, id: JobId, priority: Priority) -> bool {
        match self.jobs.get_mut(&id) {
            Some((handle, current)) => {
                *current = priority;
                handle.set_priority(priority);
                true
            }
            None => false,
        }
    }

    fn cancel(&self, id: JobId) -> bool {
        match self.jobs.get(&id) {
            Some((handle, _)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Handles of parked jobs; nothing can raise them once input ends
    fn parked(&self) -> Vec<JobHandle> {
        self.jobs
            .values()
            .filter(|(_, priority)| *priority == PARKED)
            .map(|(handle, _)| handle.clone())
            .collect()
    }
}

/// Stdin is blocking, so it gets a thread of its own
fn spawn_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.unbounded_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print(value: Value) {
    println!("{}", value);
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args)?;
    log::info!(
        "starting {} instances of {}",
        config.max_concurrency,
        config.module.display()
    );

    let mut local = LocalPool::new();
    let spawner = local.spawner();
    let pool = Pool::from_config(&config, spawner.clone())
        .with_context(|| format!("failed to load {}", config.module.display()))?;

    let outstanding: Rc<RefCell<Outstanding>> = Rc::default();
    let mut lines = spawn_reader();

    local.run_until(async {
        let mut reports: Vec<RemoteHandle<()>> = Vec::new();
        while let Some(line) = lines.next().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let command = match parse_line(line) {
                Ok(command) => command,
                Err(err) => {
                    eprintln!("{:#}", err);
                    continue;
                }
            };

            match command {
                Command::Submit { method, params } => {
                    let job = if args.stream {
                        let job = StreamJob::new(&method, params, args.priority, |data| {
                            print(json!({"data": data}))
                        });
                        pool.submit_streaming(job)
                    } else {
                        pool.submit(&method, params, args.priority)
                    };
                    let id = job.id();
                    eprintln!("job {} submitted", id);
                    outstanding.borrow_mut().insert(job.handle(), args.priority);

                    let outstanding = outstanding.clone();
                    let report = async move {
                        let result = job.await;
                        outstanding.borrow_mut().remove(id);
                        match result {
                            Ok(result) => print(json!({"id": id, "result": result})),
                            Err(err) => eprintln!("job {}: {}", id, err),
                        }
                    };
                    match spawner.spawn_local_with_handle(report) {
                        Ok(handle) => reports.push(handle),
                        Err(err) => eprintln!("job {}: {}", id, err),
                    }
                }
                Command::Priority { id, priority } => {
                    if !outstanding.borrow_mut().set_priority(id, priority) {
                        eprintln!("no pending job {}", id);
                    }
                }
                Command::Cancel { id } => {
                    if !outstanding.borrow().cancel(id) {
                        eprintln!("no pending job {}", id);
                    }
                }
                Command::Metrics => match serde_json::to_value(pool.metrics()) {
                    Ok(metrics) => print(metrics),
                    Err(err) => eprintln!("{}", err),
                },
            }
        }

        // Input is done: parked jobs would wait forever, the rest may finish
        let parked = outstanding.borrow().parked();
        for handle in parked {
            handle.cancel();
        }
        join_all(reports).await;
    });

    pool.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit() {
        match parse_line(r#"log {"limit": 5}"#).unwrap() {
            Command::Submit { method, params } => {
                assert_eq!(method, "log");
                assert_eq!(params, json!({"limit": 5}));
            }
            _ => panic!("expected a submission"),
        }
        match parse_line("status").unwrap() {
            Command::Submit { method, params } => {
                assert_eq!(method, "status");
                assert!(params.is_null());
            }
            _ => panic!("expected a submission"),
        }
        assert!(parse_line("log {not json").is_err());
    }

    #[test]
    fn test_parse_control() {
        assert!(matches!(parse_line("!metrics").unwrap(), Command::Metrics));
        assert!(matches!(parse_line("!cancel 4").unwrap(), Command::Cancel { id: 4 }));
        assert!(matches!(
            parse_line("!priority 4 0").unwrap(),
            Command::Priority { id: 4, priority: 0 }
        ));
        assert!(parse_line("!priority four 1").is_err());
        assert!(parse_line("!reboot").is_err());
    }

    struct Recorder {
        calls: RefCell<Vec<String>>,
    }

    impl wasi_pool::pool::JobControl for Recorder {
        fn set_priority(self: Rc<Self>, id: JobId, priority: Priority) {
            self.calls.borrow_mut().push(format!("priority {} {}", id, priority));
        }

        fn cancel(self: Rc<Self>, id: JobId) {
            self.calls.borrow_mut().push(format!("cancel {}", id));
        }
    }

    #[test]
    fn test_parked_jobs_released_at_eof() {
        let recorder = Rc::new(Recorder { calls: RefCell::default() });
        let control: Rc<dyn wasi_pool::pool::JobControl> = recorder.clone();
        let handle = |id| JobHandle::new(id, Rc::downgrade(&control));

        let mut outstanding = Outstanding::default();
        outstanding.insert(handle(1), 1);
        outstanding.insert(handle(2), PARKED);
        outstanding.insert(handle(3), PARKED);

        // Raising a parked job takes it out of the release set
        assert!(outstanding.set_priority(3, 4));
        assert!(!outstanding.set_priority(9, 4));

        let parked: Vec<JobId> = outstanding.parked().iter().map(JobHandle::id).collect();
        assert_eq!(parked, vec![2]);

        outstanding.remove(2);
        assert!(outstanding.parked().is_empty());
        assert!(outstanding.cancel(1));
        assert!(!outstanding.cancel(2));
        assert_eq!(*recorder.calls.borrow(), vec!["priority 3 4", "cancel 1"]);
    }

    #[test]
    fn test_module_is_required() {
        let args = Args::parse_from(["wasi-pool", "-j", "2"]);
        assert!(load_config(&args).is_err());

        let args = Args::parse_from(["wasi-pool", "--module", "guest.wasm", "-j", "2", "--trace"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert!(config.guest.trace_syscalls);

        let args = Args::parse_from(["wasi-pool", "--module", "g.wasm", "--zip", "repo.zip"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.zip, Some(PathBuf::from("repo.zip")));
        assert!(Args::try_parse_from(["wasi-pool", "--zip", "a.zip", "--root", "/srv"]).is_err());
    }
}
