#![forbid(unsafe_code)]

use registry_proxy::runtime::run_from_env;
use std::thread;

const USAGE: &str = "\
Usage: registry-proxy

All configuration is read from REGISTRY_PROXY_* environment variables.

Options:
  -h, --help  Print help
";

fn parse_env_usize(key: &str, default: usize, min: usize, max: usize) -> usize {
    let raw = std::env::var(key).ok();
    parse_usize_or_default(raw.as_deref(), default, min, max)
}

fn parse_usize_or_default(raw: Option<&str>, default: usize, min: usize, max: usize) -> usize {
    let parsed = raw
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default);
    parsed.clamp(min, max)
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let available_parallelism = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let worker_threads_default = available_parallelism.clamp(2, 8);
    let worker_threads = parse_env_usize(
        "REGISTRY_PROXY_TOKIO_WORKER_THREADS",
        worker_threads_default,
        1,
        128,
    );
    let max_blocking_threads =
        parse_env_usize("REGISTRY_PROXY_TOKIO_MAX_BLOCKING_THREADS", 64, 8, 512);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .max_blocking_threads(max_blocking_threads)
        .build()
}

fn main() {
    let mut args = std::env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                return;
            }
            other => {
                eprintln!("unknown argument: {other}\n\n{USAGE}");
                std::process::exit(2);
            }
        }
    }

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to initialize tokio runtime: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = runtime.block_on(run_from_env()) {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_usize_or_default;

    #[test]
    fn parse_env_usize_clamps_values() {
        assert_eq!(parse_usize_or_default(Some("900"), 4, 1, 32), 32);
        assert_eq!(parse_usize_or_default(Some("0"), 4, 1, 32), 1);
    }

    #[test]
    fn parse_env_usize_uses_default_for_invalid_values() {
        assert_eq!(parse_usize_or_default(Some("invalid"), 7, 1, 32), 7);
        assert_eq!(parse_usize_or_default(None, 7, 1, 32), 7);
    }
}
