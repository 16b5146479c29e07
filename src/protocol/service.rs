use std::io::{Read, Write};

use log::{info, warn};

use crate::executor::QueryExecutor;

use super::{
    Endpoint, Packet, PacketType,
    transport::{PacketTransport, ProtocolViolation, TransportError},
};

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The query ran and its table was delivered.
    Answered { rows: usize },
    /// The query failed; the error text went back in an ERROR packet.
    Failed { message: String },
    /// The packet was not a QUERY and was answered with a NACK.
    Rejected(ProtocolViolation),
}

/// Serves exactly one request from `transport`.
///
/// A QUERY is acknowledged, executed, and answered with the result table or an ERROR
/// packet. Anything else gets a NACK. Query failures and stray packets leave the session
/// usable; only transport errors are returned.
pub fn serve_request<T, E>(
    transport: &mut PacketTransport<T>,
    executor: &E,
) -> Result<Outcome, TransportError>
where
    T: Read + Write,
    E: QueryExecutor + ?Sized,
{
    let packet = transport.recv()?;

    match packet.kind() {
        PacketType::Query => {
            let query = packet.payload().unwrap_or_default();
            transport.send(&Packet::ack())?;

            info!("executing query: {query}");
            match executor.execute(query) {
                Ok(table) => {
                    transport.send_table(&table)?;
                    Ok(Outcome::Answered { rows: table.len() })
                }
                Err(e) => {
                    warn!("query failed: {e}");
                    transport.send(&Packet::error(e.to_string()))?;
                    Ok(Outcome::Failed {
                        message: e.to_string(),
                    })
                }
            }
        }
        received => {
            let violation = ProtocolViolation {
                expected: "QUERY",
                received,
            };
            warn!("{violation}, answering NACK");
            transport.send(&Packet::nack())?;
            Ok(Outcome::Rejected(violation))
        }
    }
}

/// Serves one request on the connection at `index` of `endpoint`.
pub fn serve<E>(endpoint: &Endpoint, index: usize, executor: &E) -> Result<Outcome, TransportError>
where
    E: QueryExecutor + ?Sized,
{
    endpoint.exchange(index, |transport| serve_request(transport, executor))
}
