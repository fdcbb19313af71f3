mod address;
mod async_stream;
mod config;
mod crc16;
mod dest_provider;
mod frame;
mod keepalive;
mod ngrok;
mod socket_util;
mod tcp_to_udp;
mod transport;
mod udp_to_tcp;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

use crate::config::{ClientEngineConfig, Config, DestSpec, ServerEngineConfig};
use crate::dest_provider::{DestProvider, NgrokDest, StaticDest};
use crate::ngrok::NgrokClient;

const ENGINE_RESTART_DELAY: Duration = Duration::from_secs(1);

fn print_usage_and_exit(arg0: &str) -> ! {
    eprintln!("Usage: {} [OPTION]..", arg0);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --src-tcp, -T HOST:PORT  accept framed streams here (server engine)");
    eprintln!("  --dst-udp, -u HOST:PORT  forward datagrams here (default {})", config::DEFAULT_UDP_DEST);
    eprintln!("  --src-udp, -U HOST:PORT  accept datagrams here (client engine)");
    eprintln!("  --dst-tcp, -t HOST:PORT  connect framed streams here");
    eprintln!("  --transport raw|websocket  stream transport (default raw)");
    eprintln!("  --ws-header 'Key: value' extra WebSocket handshake header (repeatable)");
    eprintln!("  --tcp-keep-alive [SECS]  enable TCP keep-alive (default idle {}s)", config::DEFAULT_TCP_KEEP_ALIVE_SECS);
    eprintln!("  --app-keep-alive SECS    idle seconds between heartbeat frames (0 = off)");
    eprintln!("  --ngrok-endpoint ID|RE   resolve the stream destination from the ngrok API");
    eprintln!("  --ngrok-api-key KEY      ngrok API key (default ENV:NGROK_API_KEY)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} --src-tcp 0.0.0.0:7000 --dst-udp 127.0.0.1:51820", arg0);
    eprintln!("  {} --src-udp 127.0.0.1:51821 --dst-tcp 198.51.100.7:7000", arg0);
    std::process::exit(1);
}

fn start_server_engine(config: ServerEngineConfig) -> JoinHandle<()> {
    println!(
        "Starting tcp->udp relay: {} >> {} ({})",
        config.tcp_listen, config.udp_dest, config.transport
    );
    tokio::spawn(async move {
        loop {
            if let Err(e) = tcp_to_udp::run(config.clone()).await {
                error!("tcp->udp engine failed: {}", e);
            }
            tokio::time::sleep(ENGINE_RESTART_DELAY).await;
        }
    })
}

fn start_client_engine(config: ClientEngineConfig) -> JoinHandle<()> {
    let provider: Arc<dyn DestProvider> = match config.dest {
        DestSpec::Static(ref location) => {
            println!(
                "Starting udp->tcp relay: {} >> {} ({})",
                config.udp_listen, location, config.transport
            );
            Arc::new(StaticDest::new(location.clone()))
        }
        DestSpec::Ngrok { ref api_key, ref filter } => {
            println!(
                "Starting udp->tcp relay: {} >> ngrok:{} ({})",
                config.udp_listen, filter, config.transport
            );
            let client = Arc::new(NgrokClient::new(api_key.clone()));
            Arc::new(NgrokDest::new(client, filter.clone()))
        }
    };
    tokio::spawn(async move {
        loop {
            if let Err(e) = udp_to_tcp::run(config.clone(), provider.clone()).await {
                error!("udp->tcp engine failed: {}", e);
            }
            tokio::time::sleep(ENGINE_RESTART_DELAY).await;
        }
    })
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage_and_exit(&arg0);
    }

    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}\n", arg0, e);
            print_usage_and_exit(&arg0);
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let mut join_handles = Vec::with_capacity(2);
        if let Some(server_config) = config.server {
            join_handles.push(start_server_engine(server_config));
        }
        if let Some(client_config) = config.client {
            join_handles.push(start_client_engine(client_config));
        }

        tokio::signal::ctrl_c()
            .await
            .expect("Could not listen for shutdown signal");
        println!("Shutting down..");
        for handle in join_handles {
            handle.abort();
        }
    });
}
