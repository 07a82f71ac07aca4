use anyhow::Result;
use clap::{CommandFactory, Parser};
use mc_inspect::client::TcpConnector;
use mc_inspect::dispatch::{Action, McInspect, Options};
use mc_inspect::inspector::CrawlerInspector;
use mc_inspect::output::{OutputFormat, RecordWriter};
use mc_inspect::servers::ServerSet;
use tracing_subscriber::EnvFilter;

const ACTIONS_HELP: &str = "\
Actions:
  list                  List keys: server|expiration|size|key
  dump                  Like list, followed by each value
  grep <pattern>        Items whose key or text value matches a regex
  get <key>...          Values of the given keys
  set <key> <value>     Store a value
  incr <key>...         Add --delta to counters
  decr <key>...         Subtract --delta from counters
  delete <key>...       Remove keys
  flush                 Invalidate all items
  stats                 Server statistics: server|stat|value";

/// Inspect and edit the items held by memcached servers
#[derive(Parser)]
#[command(name = "mc-inspect", version, about, after_help = ACTIONS_HELP)]
struct Cli {
    /// Server address, host[:port] (repeatable). Default: 127.0.0.1:11211
    #[arg(short = 's', long = "server")]
    servers: Vec<String>,

    /// Read server addresses from an environment variable (repeatable).
    /// The variable may hold several addresses separated by commas.
    #[arg(long = "server-env")]
    server_envs: Vec<String>,

    /// Leave out items larger than this many bytes (list/dump). 0 means no limit
    #[arg(short = 'z', long, default_value = "0", allow_negative_numbers = true)]
    max_value_size: i64,

    /// Amount to add or subtract (incr/decr)
    #[arg(short = 'd', long, default_value = "1", allow_negative_numbers = true)]
    delta: i64,

    /// Case-insensitive matching (grep)
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Select items that do not match (grep)
    #[arg(short = 'v', long)]
    invert_match: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Pipe)]
    output: OutputFormat,

    /// Action to run
    action: Option<String>,

    /// Arguments of the action (use `--` before arguments starting with '-')
    args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let action = match Action::parse(cli.action.as_deref(), &cli.args) {
        Ok(action) => action,
        Err(e) => {
            eprintln!("error: {e}\n");
            eprintln!("{}", Cli::command().render_help());
            std::process::exit(2);
        }
    };

    let servers = ServerSet::from_args_and_env(&cli.servers, &cli.server_envs)?;
    let options = Options {
        max_value_size: cli.max_value_size,
        delta: cli.delta,
        ignore_case: cli.ignore_case,
        invert_match: cli.invert_match,
    };

    tracing::info!(
        action = action.name(),
        servers = servers.len(),
        max_value_size = options.max_value_size,
        "Starting mc-inspect"
    );

    let tool = McInspect::new(TcpConnector, CrawlerInspector, servers, options);
    let stdout = std::io::stdout();
    let mut out = RecordWriter::new(stdout.lock(), cli.output);
    tool.run(&action, &mut out).await?;

    Ok(())
}
