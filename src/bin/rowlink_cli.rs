use std::{error::Error, io, net::SocketAddr};

use clap::Parser;
use rowlink::{
    Command, prompt,
    protocol::{Client, TransportError},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the rowlink server
    server: SocketAddr,
    /// Local address to connect from
    #[arg(long, default_value = "0.0.0.0:0")]
    local: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut client = Client::new(cli.server, cli.local)?;
    client.connect()?;

    loop {
        let reader = io::stdin().lock();
        let writer = io::stdout().lock();

        let query = match prompt(reader, writer) {
            Ok(Command::Exit) => break,
            Ok(Command::Empty) => continue,
            Ok(Command::Query(query)) => query,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match client.query(&query) {
            Ok(table) => println!("{table}"),
            Err(TransportError::Remote { message }) => eprintln!("query error: {message}"),
            Err(e) => {
                eprintln!("connection lost: {e}");
                break;
            }
        }
    }

    client.stop()?;
    Ok(())
}
