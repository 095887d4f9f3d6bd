use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use burrow::adapter::ProxyAdapter;
use burrow::config::{self, LoadedConfig};
use burrow::environment::Environment;
use burrow::inbound::start_inbounds;
use burrow::provider::ProxyProvider;
use burrow::rule::Matchers;
use burrow::tunnel::Tunnel;
use log::{debug, error, info};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Builder;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_FILE: &str = "config.burrow.yaml";
const RELOAD_DELAY: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Debug)]
struct ConfigChanged;

fn start_notify_thread(
    config_paths: &[String],
) -> notify::Result<(RecommendedWatcher, UnboundedReceiver<ConfigChanged>)> {
    let (tx, rx) = unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Modify(..)) {
                let _ = tx.send(ConfigChanged);
            }
        }
        Err(e) => error!("watch error: {e:?}"),
    })?;

    for config_path in config_paths {
        watcher.watch(Path::new(config_path), RecursiveMode::NonRecursive)?;
    }

    Ok((watcher, rx))
}

/// Everything started from one configuration generation.
struct Running {
    cancel: CancellationToken,
    tunnel: Arc<Tunnel>,
    providers: Vec<Arc<dyn ProxyProvider>>,
    join_handles: Vec<JoinHandle<()>>,
}

impl Running {
    /// Stops the listeners, live connections, provider timers and pooled mux sessions.
    async fn stop(self) {
        self.cancel.cancel();
        self.tunnel.close();
        for provider in self.providers {
            provider.close();
        }
        for join_handle in self.join_handles {
            join_handle.abort();
        }
        for proxy in self.tunnel.routes().proxies().values() {
            proxy.close().await;
        }
    }
}

async fn start(loaded: LoadedConfig, env: &Arc<Environment>, cancel: CancellationToken) -> std::io::Result<Running> {
    env.reload(&loaded.settings).await?;

    for provider in loaded.providers.iter() {
        if let Err(e) = provider.initial().await {
            error!("[Provider] {} failed to load: {e}", provider.name());
        }
    }

    let tunnel = Tunnel::new(env.clone(), loaded.routes, loaded.udp_timeout);
    let running = Running {
        cancel: cancel.clone(),
        tunnel: tunnel.clone(),
        providers: loaded.providers,
        join_handles: vec![],
    };
    match start_inbounds(loaded.inbounds, &tunnel, env, &cancel).await {
        Ok(join_handles) => Ok(Running {
            join_handles,
            ..running
        }),
        Err(e) => {
            running.stop().await;
            Err(e)
        }
    }
}

fn print_usage_and_exit(arg0: String) {
    eprintln!(
        "Usage: {arg0} [--threads/-t N] [--dry-run/-d] [--no-reload] <config filename> [config filename] [..]"
    );
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut dry_run = false;
    let mut no_reload = false;

    while !args.is_empty() && args[0].starts_with("-") {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--dry-run" || args[0] == "-d" {
            args.remove(0);
            dry_run = true;
        } else if args[0] == "--no-reload" {
            args.remove(0);
            no_reload = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.is_empty() {
        println!("No config specified, assuming loading from file {DEFAULT_CONFIG_FILE}");
        args.push(DEFAULT_CONFIG_FILE.to_string())
    }

    if dry_run {
        println!("Starting dry run.");
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {num_threads}");
    } else {
        println!("Using custom thread count ({num_threads})");
    }

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        mt.worker_threads(num_threads);
        mt
    };

    let runtime = match builder.enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let env = Environment::native();

        let mut reload_state = if no_reload || dry_run {
            None
        } else {
            match start_notify_thread(&args) {
                Ok(state) => Some(state),
                Err(e) => {
                    eprintln!("Failed to watch config files: {e}\n");
                    print_usage_and_exit(arg0);
                    return;
                }
            }
        };

        loop {
            let config = match config::load_configs(&args).await {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load configs: {e}\n");
                    print_usage_and_exit(arg0);
                    return;
                }
            };

            debug!("================================================================================");
            debug!("{config:#?}");
            debug!("================================================================================");

            let cancel = env.child_token();
            let loaded = match config::build_config(config, &env, &Matchers::default(), &cancel) {
                Ok(loaded) => loaded,
                Err(e) => {
                    if dry_run {
                        eprintln!("Dry run failed, could not build config: {e}\n");
                        return;
                    }
                    eprintln!("Failed to build config: {e}\n");
                    print_usage_and_exit(arg0);
                    return;
                }
            };

            if dry_run {
                println!("Finishing dry run, config parsed successfully.");
                return;
            }

            let inbound_count = loaded.inbounds.len();
            let running = match start(loaded, &env, cancel).await {
                Ok(running) => running,
                Err(e) => {
                    eprintln!("Failed to start: {e}\n");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
            info!("Started {inbound_count} inbound(s)");

            match reload_state.as_mut() {
                Some((_watcher, rx)) => {
                    // Wait for config change
                    if rx.recv().await.is_none() {
                        error!("config watcher stopped");
                        futures::future::pending::<()>().await;
                    }

                    println!("Configs changed, restarting in {} seconds..", RELOAD_DELAY.as_secs());

                    running.stop().await;

                    tokio::time::sleep(RELOAD_DELAY).await;

                    // Remove any extra events
                    while rx.try_recv().is_ok() {}
                }
                None => {
                    // No reload mode - wait forever
                    futures::future::pending::<()>().await;
                }
            }
        }
    });
}
