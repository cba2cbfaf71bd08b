//! courier configs

pub mod cli {
    //! Parse from either cli or env var

    /// default server to connect to or listen on
    pub static DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
    /// default broker listen addr
    pub static DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4222";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "courier-worker";
    /// default log level. Can use this argument or COURIER_LOG env var
    pub const DEFAULT_COURIER_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";
    /// default wait for a reply, in ms
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;
    use clap::Subcommand;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "courier", bin_name = "courier", about, long_about = None)]
    /// parses from cli & environment var. courier will load `.env` in the working dir as well
    pub struct Config {
        /// path to a client config file (yaml or json)
        #[clap(short, long, value_parser, env = "COURIER_CONFIG")]
        pub config_path: Option<PathBuf>,
        /// servers to connect to, comma separated. Overrides the config file
        #[clap(short, long, env = "COURIER_SERVERS", value_delimiter = ',')]
        pub servers: Vec<String>,
        /// path to a `.creds` bundle. Overrides the config file
        #[clap(long, value_parser, env = "COURIER_CREDS")]
        pub creds: Option<PathBuf>,
        /// connection name reported to the server
        #[clap(long, env = "COURIER_NAME")]
        pub name: Option<String>,
        /// number of tokio worker threads, defaults to logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_COURIER_LOG)]
        pub courier_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        #[clap(subcommand)]
        pub command: Command,
    }

    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// run an in-process broker on a TCP port
        Serve {
            /// address to listen on
            #[clap(long, env = "COURIER_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
            listen: SocketAddr,
            /// require user JWTs signed by one of these account keys
            #[clap(long = "trusted-issuer", env = "COURIER_TRUSTED_ISSUERS", value_delimiter = ',')]
            trusted_issuers: Vec<String>,
            /// require user JWTs from any account
            #[clap(long)]
            auth: bool,
        },
        /// publish one message
        Pub {
            subject: String,
            payload: String,
            /// reply subject
            #[clap(long)]
            reply: Option<String>,
        },
        /// print messages from a subject until interrupted
        Sub {
            subject: String,
            /// join this queue group
            #[clap(long)]
            queue: Option<String>,
            /// exit after this many messages
            #[clap(long)]
            count: Option<usize>,
        },
        /// send a request and print the reply
        Req {
            subject: String,
            payload: String,
            /// wait this long for the reply (ms)
            #[clap(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
            timeout: u64,
        },
    }

    impl Command {
        /// reply wait as a `Duration`, if this command has one
        pub fn timeout(&self) -> Option<Duration> {
            match self {
                Command::Req { timeout, .. } => Some(Duration::from_millis(*timeout)),
                _ => None,
            }
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Logging setup for the process
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. `courier_log` is an `EnvFilter`
        /// directive, `log_frmt` one of "json", "pretty" or "standard".
        pub fn parse(courier_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(courier_log).or_else(|_| EnvFilter::try_new("info"))?;

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .try_init()?;
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .try_init()?;
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .try_init()?;
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
