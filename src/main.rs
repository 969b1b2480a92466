/**
 * MIT License
 *
 * Copyright (c) 2025 Takatoshi Kondo
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mqttd::tracing_setup;
use mqttd::{Broker, BrokerConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "mqttd")]
#[command(about = "MQTT 3.1 broker with configurable worker threads and logging")]
struct Args {
    /// Number of worker threads (defaults to CPU count)
    #[arg(long, default_value_t = num_cpus::get())]
    cpus: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listen port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Upper bound on concurrently connected clients
    #[arg(long, default_value_t = 100_000)]
    max_connections: usize,

    /// Persistence directory (omit for an ephemeral database)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => unreachable!(), // clap validates this
    };

    let worker_threads = if args.cpus > 0 {
        args.cpus
    } else {
        eprintln!("Worker thread count must be greater than 0. Using CPU count.");
        num_cpus::get()
    };

    // Build custom tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(log_level, worker_threads, args))
}

async fn async_main(log_level: tracing::Level, threads: usize, args: Args) -> anyhow::Result<()> {
    let _guard = tracing_setup::init_tracing(log_level)?;

    info!("Starting mqttd with log level: {log_level}, worker threads: {threads}");

    let config = BrokerConfig {
        host: args.host,
        port: args.port,
        max_connections: args.max_connections,
        persistence_path: args.data_dir,
        ..BrokerConfig::default()
    };

    let broker = Broker::new(config).await?;
    let addr = broker.listen().await?;
    info!("Broker is ready to accept connections on {addr}");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing broker");
    broker.close().await?;

    Ok(())
}
