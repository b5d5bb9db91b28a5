//! Test fixtures

mod relay_network;

pub use relay_network::{
    ChatListener, LOOPBACK, RelayNode, Terminal, dial, fast_poll, open_limits, terminal_session,
};
