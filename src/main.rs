use clap::Parser;
use log::error;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use weave::{Config, NodeId, Result, Session};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Serverless peer-to-peer text messaging")]
#[command(version)]
struct Cli {
    /// TCP port to listen on for peer connections
    #[arg(short, long, default_value_t = weave::core::DEFAULT_PORT)]
    port: u16,
    /// UDP port for DHT participation
    #[arg(long, default_value_t = weave::core::DEFAULT_PORT)]
    dht_port: u16,
    /// Known overlay member to join via (host:port)
    #[arg(short, long)]
    bootstrap: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    weave::setup_logging();

    let cli = Cli::parse();
    let config = Config {
        listen_port: cli.port,
        dht_port: cli.dht_port,
        bootstrap_peer: cli.bootstrap,
        ..Config::default()
    };

    let session = Session::start(config).await?;
    println!("node id: {}", session.id());
    println!("commands: /fetch  /join <host:port>  /connect <id>  /status  /quit");
    println!("any other line is sent to the connected peer");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if line == "/status" {
            println!("state: {:?}", session.state().current().await);
            if let Some(addr) = session.state().public_addr().await {
                println!("public address: {}", addr);
            }
            for message in session.messages().await {
                println!("< {}", message);
            }
        } else if line == "/fetch" {
            match session.fetch_public_address().await {
                Ok(addr) => println!("public address: {}", addr),
                Err(e) => error!("{}", e),
            }
        } else if let Some(target) = line.strip_prefix("/join ") {
            let parsed = target
                .rsplit_once(':')
                .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host, p)));
            match parsed {
                Some((host, port)) => {
                    if let Err(e) = session.join_network(host, port).await {
                        error!("{}", e);
                    }
                }
                None => error!("usage: /join <host:port>"),
            }
        } else if let Some(id) = line.strip_prefix("/connect ") {
            match NodeId::from_str(id) {
                Ok(id) => {
                    if let Err(e) = session.connect_to_peer(id).await {
                        error!("{}", e);
                    }
                }
                Err(e) => error!("{}", e),
            }
        } else if let Err(e) = session.send(line).await {
            error!("{}", e);
        }
    }

    session.close().await;
    Ok(())
}
