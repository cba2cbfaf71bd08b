#![allow(clippy::cognitive_complexity)]
use anyhow::{Context, Result, anyhow};

mod startup_health;

use config::ClientConfig;
use courier_core::{
    broker::{AuthPolicy, Broker, BrokerConfig},
    config::{
        cli::{self, Command, Parser},
        trace,
    },
    connection::{ConnectOptions, Connection},
    router::Message,
    tokio::{self, net::TcpListener, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use startup_health::verify_server_task_running;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        eprintln!(".env file not loaded: {err}");
    }
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.courier_log, &config.log_format)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "courier task panicked");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    match config.command.clone() {
        Command::Serve {
            listen,
            trusted_issuers,
            auth,
        } => {
            let auth = if auth || !trusted_issuers.is_empty() {
                AuthPolicy::Jwt { trusted_issuers }
            } else {
                AuthPolicy::None
            };
            serve(&config, listen, auth).await
        }
        Command::Pub {
            subject,
            payload,
            reply,
        } => {
            let conn = connect(&config).await?;
            match reply {
                Some(reply) => conn.publish_with_reply(&subject, &reply, payload).await?,
                None => conn.publish(&subject, payload).await?,
            }
            conn.flush().await.context("server did not confirm the publish")?;
            info!(%subject, "published");
            conn.close().await;
            Ok(())
        }
        Command::Sub {
            subject,
            queue,
            count,
        } => {
            let conn = connect(&config).await?;
            let result = subscribe(&conn, &subject, queue.as_deref(), count).await;
            let report = conn.close().await;
            debug!(?report, "connection closed");
            result
        }
        Command::Req {
            ref subject,
            ref payload,
            ..
        } => {
            let conn = connect(&config).await?;
            let reply = conn
                .request(subject, payload.clone(), config.command.timeout())
                .await;
            conn.close().await;
            print_message(&reply?);
            Ok(())
        }
    }
}

/// Connect options from the config file, with CLI flags taking precedence.
fn connect_options(config: &cli::Config) -> Result<ConnectOptions> {
    let mut opts = match &config.config_path {
        Some(path) => ClientConfig::parse(path)?.connect_options()?,
        None => ConnectOptions::default(),
    };
    if !config.servers.is_empty() {
        opts.servers = config.servers.clone();
    }
    if let Some(creds) = &config.creds {
        opts.credentials_path = Some(creds.clone());
    }
    if let Some(name) = &config.name {
        opts.name = Some(name.clone());
    }
    Ok(opts)
}

async fn connect(config: &cli::Config) -> Result<Connection> {
    let opts = connect_options(config)?;
    info!(servers = ?opts.servers, name = ?opts.name, "connecting");
    Connection::connect(opts)
        .await
        .context("failed to connect")
}

async fn subscribe(
    conn: &Connection,
    subject: &str,
    queue: Option<&str>,
    count: Option<usize>,
) -> Result<()> {
    let mut sub = match queue {
        Some(queue) => conn.queue_subscribe(subject, queue).await?,
        None => conn.subscribe(subject).await?,
    };
    info!(subject, ?queue, "listening");
    let mut received = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(received, "interrupted");
                return Ok(());
            }
            msg = sub.next() => match msg {
                Some(msg) => {
                    print_message(&msg);
                    received += 1;
                    if count.is_some_and(|count| received >= count) {
                        return Ok(());
                    }
                }
                None => {
                    let report = conn.closed().await;
                    return match report.reason {
                        Some(err) => Err(err).context("connection lost"),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}

fn print_message(msg: &Message) {
    let payload = String::from_utf8_lossy(&msg.payload);
    match &msg.reply {
        Some(reply) => println!("[{}] (reply {reply}) {payload}", msg.subject),
        None => println!("[{}] {payload}", msg.subject),
    }
}

async fn serve(config: &cli::Config, listen: std::net::SocketAddr, auth: AuthPolicy) -> Result<()> {
    let broker = Broker::new(BrokerConfig {
        name: config.name.clone().unwrap_or_else(|| "courier".to_owned()),
        auth,
        ..Default::default()
    });
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let token = CancellationToken::new();
    let mut task: JoinHandle<Result<()>> = tokio::spawn({
        let token = token.clone();
        async move { broker.serve(listener, token).await.map_err(|err| anyhow!(err)) }
    });
    if let Err(err) = verify_server_task_running("broker", &mut task).await {
        token.cancel();
        return Err(err);
    }
    info!(%listen, "broker ready");

    tokio::spawn(shutdown_signal(token));
    flatten(task).await
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
