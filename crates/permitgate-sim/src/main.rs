mod workload;

use std::process;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use workload::SimConfig;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: permitgate-sim [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --strategy <asap|fifo>   Admission strategy [default: asap]");
            eprintln!("  --limit <n>              Permits per scope [default: 10]");
            eprintln!("  --consumers <n>          Consumers to register [default: 200]");
            eprintln!("  --max-permits <n>        Largest single request [default: 4]");
            eprintln!("  --hold-ms <n>            Longest hold time per consumer [default: 5]");
            eprintln!("  --units <n>              Independent units (scopes) [default: 2]");
            eprintln!("  --timeout-secs <n>       Abort if the workload doesn't drain [default: 60]");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  PERMITGATE_LOG           debug|info|warn|error [default: info]");
            eprintln!("  LOG_FORMAT=json          JSON log lines on stderr");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(config) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(config: SimConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(workload::run(config))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.violations > 0 {
        anyhow::bail!("{} oversubscription(s) observed", report.violations);
    }
    Ok(())
}

/// Initialize tracing with PERMITGATE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PERMITGATE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("permitgate={level},permitgate_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<SimConfig, String> {
    let mut config = SimConfig::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--strategy" => config.strategy = next_value(args, &mut i, flag)?.parse()?,
            "--limit" => config.limit = parse_number(flag, next_value(args, &mut i, flag)?)?,
            "--consumers" => {
                config.consumers = parse_number(flag, next_value(args, &mut i, flag)?)?
            }
            "--max-permits" => {
                config.max_permits = parse_number(flag, next_value(args, &mut i, flag)?)?
            }
            "--hold-ms" => {
                config.hold =
                    Duration::from_millis(parse_number(flag, next_value(args, &mut i, flag)?)?)
            }
            "--units" => config.units = parse_number(flag, next_value(args, &mut i, flag)?)?,
            "--timeout-secs" => {
                config.timeout =
                    Duration::from_secs(parse_number(flag, next_value(args, &mut i, flag)?)?)
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    if config.limit == 0 {
        return Err("--limit must be positive".to_string());
    }
    Ok(config)
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{flag} expects a non-negative integer, got {value:?}"))
}
