// Carretón Relay — WhatsApp solicitation/cancellation relay
//
//   config — RelayConfig (defaults → TOML → CLI/env), Cli
//   engine — Evolution API client, webhook translation, HTTP listener
//   relay  — logging init, process wiring, signal handling
//
// Classification, routing and reconnection live in `carreton-core`.

pub mod config;
pub mod engine;
pub mod relay;

pub use config::{Cli, RelayConfig};
pub use relay::{init_logging, run};
