use std::env;
use std::process::exit;
use std::sync::atomic::Ordering;

use tracing::{error, info, warn};

use task_scheduler::scheduler::{CommandExecutor, Scheduler};

const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

fn print_usage() {
    eprintln!("Usage: autohub-scheduler [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Configuration file (default: {})", DEFAULT_CONFIG_PATH);
    eprintln!("  --status          Print scheduler status and exit");
    eprintln!("  --daemon          Accepted for service manager compatibility");
    eprintln!("  --help            Show this help");
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix(&format!("{}=", flag)) {
            return Some(value.to_string());
        }
        if arg == flag {
            return iter.next().cloned();
        }
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn print_status(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::new(config_path, CommandExecutor::default())?;
    let status = scheduler.status();
    println!("running: {}", status.running);
    println!("loaded tasks: {}", status.loaded_tasks);
    println!("scheduled jobs: {}", status.scheduled_jobs);
    println!(
        "memory: {:.1} MB rss / {:.1} MB vms",
        status.memory.rss_mb, status.memory.vms_mb
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if has_flag(&args, "--help") {
        print_usage();
        return Ok(());
    }

    let config_path = parse_arg(&args, "--config")
        .or_else(|| env::var("AUTOHUB_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if has_flag(&args, "--status") {
        return print_status(&config_path);
    }
    if has_flag(&args, "--daemon") {
        info!("daemon mode requested, process management is left to the service manager");
    }

    // High memory usage ends the inner loop with a restart request; the
    // outer loop rebuilds the scheduler with a clean slate.
    loop {
        let mut scheduler = match Scheduler::new(&config_path, CommandExecutor::default()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                error!("failed to initialize scheduler: {}", err);
                exit(1);
            }
        };

        let stop = scheduler.stop_handle();
        let signal_stop = stop.clone();
        let signals = tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut terminate =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            signal_stop.store(true, Ordering::Relaxed);
        });

        let restart = tokio::task::spawn_blocking(move || scheduler.start()).await??;
        signals.abort();

        if !restart {
            break;
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        warn!("restarting scheduler after memory pressure");
    }

    info!("scheduler exited");
    Ok(())
}
