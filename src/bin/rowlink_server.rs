use std::{
    error::Error,
    net::SocketAddr,
    sync::{Arc, mpsc},
};

use clap::Parser;
use log::{debug, info, warn};
use rowlink::{
    MemoryExecutor,
    protocol::{DEFAULT_BLOCK_SIZE, Outcome, Server, ServerOptions, ThreadPool, serve},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Rows per DATA packet
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
    /// Rows of test data in the `users` table
    #[arg(long, default_value_t = 1000)]
    populate: usize,
    /// Threads serving requests
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let executor = Arc::new(MemoryExecutor::new());
    executor.populate(cli.populate)?;

    let options = ServerOptions::default().with_block_size(cli.block_size);
    let mut server = Server::with_options(cli.address, options)?;
    let endpoint = server.endpoint();
    let pool = ThreadPool::new(cli.workers.max(1));

    server.on_connect(|c| info!("{}:{} joined as #{}", c.client_ip, c.client_port, c.index));
    server.on_disconnect(|c| info!("{}:{} (#{}) left", c.client_ip, c.client_port, c.index));
    server.on_available(move |c| {
        let endpoint = Arc::clone(&endpoint);
        let executor = Arc::clone(&executor);
        let index = c.index;

        pool.execute(move || match serve(&endpoint, index, executor.as_ref()) {
            Ok(Outcome::Answered { rows }) => debug!("answered #{index} with {rows} rows"),
            Ok(_) => {}
            Err(e) => {
                warn!("dropping client #{index}: {e}");
                if let Err(e) = endpoint.close(index) {
                    debug!("close of #{index} failed: {e}");
                }
            }
        });
    });

    let (interrupt, interrupted) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(());
    })?;

    server.accept()?;
    interrupted.recv()?;

    info!("shutting down");
    server.stop_server()?;
    // Unblocks workers still waiting on a client before the pool is joined.
    for index in 0..server.clients().len() {
        server.stop_client(index)?;
    }
    Ok(())
}
