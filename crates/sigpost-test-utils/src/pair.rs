//! Run a real client machine against a real server handler in memory.

use std::sync::Arc;

use sigpost_core::client::{self, ClientError, ClientMachine, ClientState};
use sigpost_core::server::{self, ServerContext, ServerError};

/// Buffer size of the in-memory pipe between the two sides.
const PIPE_CAPACITY: usize = 256 * 1024;

/// What both ends reported after one interaction.
pub struct InteractionOutcome {
    pub client: Result<ClientState, ClientError>,
    pub server: Result<(), ServerError>,
}

/// Connect `machine` to a server handler over `tokio::io::duplex` and run a
/// single interaction to completion.
pub async fn run_interaction(
    ctx: Arc<ServerContext>,
    machine: &mut ClientMachine,
) -> InteractionOutcome {
    let (client_end, server_end) = tokio::io::duplex(PIPE_CAPACITY);
    let server_task = tokio::spawn(server::handle_connection(ctx, server_end));
    let client = client::interact(machine, client_end).await;
    let server = match server_task.await {
        Ok(result) => result,
        Err(e) => panic!("server task panicked: {e}"),
    };
    InteractionOutcome { client, server }
}
