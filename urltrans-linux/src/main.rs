// urltrans-linux: fetch an HTTP / Shoutcast audio stream and write it to a file or stdout.

mod config;
mod http;
mod reactor;
mod sink;
mod stream;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: urltrans-linux [--output <path>] [--probe <bytes>] <url>";

fn main() -> anyhow::Result<()> {
    let mut url = None;
    let mut output = None;
    let mut probe = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("urltrans-linux {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            "--output" | "-o" => output = Some(args.next().context("--output needs a path")?),
            "--probe" => {
                let n = args.next().context("--probe needs a byte count")?;
                probe = Some(n.parse::<usize>().with_context(|| format!("invalid --probe value {n}"))?);
            }
            s if s.starts_with('-') => anyhow::bail!("unknown option {s}\n{USAGE}"),
            _ => url = Some(arg.clone()),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load();
    if let Some(o) = output {
        cfg.output = o;
    }
    let url = url
        .or_else(|| cfg.url.clone())
        .with_context(|| format!("no stream URL given\n{USAGE}"))?;

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(stream::run(cfg, url, probe))
}
