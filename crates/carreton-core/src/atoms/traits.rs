// ── Carretón Atoms: Traits ─────────────────────────────────────────────────
// The seam between the engine and a concrete WhatsApp protocol client.

use async_trait::async_trait;

use super::error::EngineResult;
use super::types::SendOptions;

/// Outbound half of a protocol client. Inbound traffic (connection updates,
/// message batches) arrives separately as `SessionEvent`s on the session queue.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Name used in log prefixes and error messages.
    fn name(&self) -> &str;

    /// Open (or re-open) the session. Connection progress is reported
    /// asynchronously through session events, not through the return value.
    async fn start_session(&self) -> EngineResult<()>;

    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> EngineResult<()>;

    /// Terminate the session on the server side.
    async fn logout(&self) -> EngineResult<()>;
}
