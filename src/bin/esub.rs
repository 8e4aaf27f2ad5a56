//! `esub` command line client.
//!
//! ```text
//! esub <key>                       wait for one message and print it
//! esub <key> -d DATA               reply to a waiting subscriber
//! esub <key> -d -                  reply with stdin as the message
//! esub <key> -p [-s]               print messages from a persistent sub
//! esub <key> -r -d A,B,C           send each item over a persistent rep
//! esub <key> -r -d -               send each stdin line over a persistent rep
//! ```

use std::io::{self, BufRead, Read, Write};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use esub::blocking::Client;
use esub::{
    // ---
    ClientConfig,
    PrepMessage,
    PrepOptions,
    PsubOptions,
    ReplyOptions,
    SubscribeOptions,
    Token,
};

#[derive(Debug, Parser)]
#[command(name = "esub", version, about = "esub client", long_about = None)]
struct Args {
    /// Key to sub or rep on
    key: String,

    /// Rep a waiting sub with data (- for stdin)
    #[arg(short, long)]
    data: Option<String>,

    /// Token to use
    #[arg(short, long, env = "ESUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// esub server node
    #[arg(short = 'H', long, default_value = "localhost", env = "ESUB_SERVICE_HOST")]
    host: String,

    /// esub server port
    #[arg(short = 'P', long, default_value_t = esub::DEFAULT_PORT, env = "ESUB_SERVICE_PORT")]
    port: u16,

    /// Sub with a persistent sub
    #[arg(short, long)]
    psub: bool,

    /// Rep with a persistent rep
    #[arg(short = 'r', long)]
    prep: bool,

    /// Optional timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Share the persistent sub with other subscribers
    #[arg(short, long)]
    shared: bool,

    /// Enable debug logging and show full error chains
    #[arg(short = 'D', long)]
    debug: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Data {
    Stdin,
    Value(String),
}

impl Data {
    fn parse(arg: &str) -> Self {
        match arg {
            "-" => Data::Stdin,
            other => Data::Value(other.to_string()),
        }
    }
}

/// What one invocation does, decided from the flags alone.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Sub,
    Psub,
    Rep(Data),
    Prep(Data),
}

impl Mode {
    fn of(args: &Args) -> Self {
        // ---
        match args.data.as_deref().map(Data::parse) {
            Some(data) if args.prep => Mode::Prep(data),
            Some(data) => Mode::Rep(data),
            None if args.psub => Mode::Psub,
            None => Mode::Sub,
        }
    }
}

fn main() -> ExitCode {
    // ---
    let args = Args::parse();
    init_tracing(args.debug);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if args.debug {
                eprintln!("error: {err:?}");
                let mut source = std::error::Error::source(&err);
                while let Some(cause) = source {
                    eprintln!("  caused by: {cause}");
                    source = cause.source();
                }
            } else {
                eprintln!("{err}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    // ---
    let level = if debug { Level::DEBUG } else { Level::WARN };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(io::stderr)
        .try_init();
}

fn run(args: &Args) -> esub::Result<()> {
    // ---
    let mut config = ClientConfig::from_env()?
        .with_host(args.host.clone())
        .with_port(args.port);
    config.token = args.token.clone().map(Token::from);

    let client = Client::new(config)?;
    let timeout = args.timeout.map(Duration::from_secs);

    let stdin = io::stdin();
    match Mode::of(args) {
        Mode::Prep(data) => prep(&client, args, prep_items(data, stdin.lock()), timeout),
        Mode::Rep(data) => rep(&client, args, reply_body(data, stdin.lock())?, timeout),
        Mode::Psub => psub(&client, args, timeout),
        Mode::Sub => sub(&client, args, timeout),
    }
}

/// The one message a rep sends: the value, or all of stdin.
fn reply_body(data: Data, mut input: impl Read) -> io::Result<Vec<u8>> {
    // ---
    match data {
        Data::Value(value) => Ok(value.into_bytes()),
        Data::Stdin => {
            let mut buf = Vec::new();
            input.read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

/// The messages a prep sends: comma separated values, or one per input line.
fn prep_items<'a>(data: Data, input: impl BufRead + 'a) -> Box<dyn Iterator<Item = String> + 'a> {
    // ---
    match data {
        Data::Value(value) => Box::new(
            value
                .split(',')
                .map(str::to_string)
                .collect::<Vec<_>>()
                .into_iter(),
        ),
        Data::Stdin => Box::new(input.lines().map_while(|line| line.ok())),
    }
}

fn reply_options(args: &Args, timeout: Option<Duration>) -> ReplyOptions {
    ReplyOptions {
        timeout,
        psub: args.psub,
        ..ReplyOptions::default()
    }
}

fn sub(client: &Client, args: &Args, timeout: Option<Duration>) -> esub::Result<()> {
    // ---
    let opts = SubscribeOptions {
        timeout,
        ..SubscribeOptions::default()
    };
    let msg = client.subscribe_with(&args.key, None, opts)?;
    print_message(&msg)
}

fn rep(client: &Client, args: &Args, body: Vec<u8>, timeout: Option<Duration>) -> esub::Result<()> {
    // ---
    client.reply_with(&args.key, body, None, reply_options(args, timeout))
}

fn psub(client: &Client, args: &Args, timeout: Option<Duration>) -> esub::Result<()> {
    // ---
    let opts = PsubOptions {
        shared: args.shared,
        timeout,
    };
    let feed = client.persistent_subscribe(&args.key, None, opts)?;
    eprintln!("persistent sub to {}", args.key);

    for msg in feed {
        print_message(&msg)?;
    }
    Ok(())
}

fn prep(
    client: &Client,
    args: &Args,
    items: impl Iterator<Item = String>,
    timeout: Option<Duration>,
) -> esub::Result<()> {
    // ---
    let opts = PrepOptions {
        psub: args.psub,
        ..PrepOptions::default()
    };
    let publisher = client.persistent_publisher(opts)?;

    if let Some(timeout) = timeout {
        let watchdog = publisher.clone();
        thread::spawn(move || {
            thread::sleep(timeout);
            watchdog.close();
        });
    }

    for item in items {
        let msg = PrepMessage::new(args.key.clone(), item.clone());
        if let Some(confirmation) = publisher.send(msg)? {
            println!("{item:?}: {confirmation}");
        }
    }

    publisher.close();
    Ok(())
}

fn print_message(msg: &[u8]) -> esub::Result<()> {
    // ---
    let mut out = io::stdout().lock();
    out.write_all(msg)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
