// Carretón Engine — Admin Command Dispatcher
//
// Executes `!setorigen`, `!setdestino`, `!status` and `!logout` against the
// in-memory routing configuration and produces the confirmation text. The
// routing engine delivers the reply to the issuing conversation and carries
// out the logout itself.

use super::classifier::KeywordSets;
use crate::atoms::types::AdminCommand;
use log::info;
use serde::{Deserialize, Serialize};

// ── Routing configuration ──────────────────────────────────────────────

/// Source and destination conversations. Forwarding is active only when
/// both are set and non-empty. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub source: Option<String>,
    pub destination: Option<String>,
}

impl RoutingConfig {
    /// `(source, destination)` when forwarding is fully configured.
    pub fn route_pair(&self) -> Option<(&str, &str)> {
        let source = self.source.as_deref().filter(|s| !s.is_empty())?;
        let destination = self.destination.as_deref().filter(|s| !s.is_empty())?;
        Some((source, destination))
    }

    pub fn is_ready(&self) -> bool {
        self.route_pair().is_some()
    }
}

// ── Dispatch ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub text: String,
    /// `!logout`: after the reply the session is terminated and nothing
    /// else is processed.
    pub terminates_session: bool,
}

impl CommandReply {
    fn text(text: String) -> Self {
        CommandReply { text, terminates_session: false }
    }
}

pub fn dispatch(
    command: AdminCommand,
    issuing_conversation_id: &str,
    routing: &mut RoutingConfig,
    keywords: &KeywordSets,
    registry_count: usize,
) -> CommandReply {
    info!("[commands] {} from {}", command.token(), issuing_conversation_id);
    match command {
        AdminCommand::SetOrigin => {
            routing.source = Some(issuing_conversation_id.to_string());
            CommandReply::text(format!(
                "✅ *Grupo de origen configurado*\n\n\
                 🆔 {}\n\n\
                 ❌ Palabras de cancelación: {}\n\
                 📋 Palabras de solicitud: {}",
                issuing_conversation_id,
                keywords.cancellation.join(", "),
                keywords.solicitation.join(", "),
            ))
        }
        AdminCommand::SetDestination => {
            routing.destination = Some(issuing_conversation_id.to_string());
            CommandReply::text(format!(
                "✅ *Grupo de destino configurado*\n\n\
                 🆔 {}\n\n\
                 Las solicitudes y cancelaciones se reenviarán aquí.",
                issuing_conversation_id,
            ))
        }
        AdminCommand::Status => {
            CommandReply::text(status_report(routing, keywords, registry_count))
        }
        AdminCommand::Logout => CommandReply {
            text: "👋 Cerrando sesión del bot. ¡Hasta luego!".into(),
            terminates_session: true,
        },
    }
}

pub fn status_report(
    routing: &RoutingConfig,
    keywords: &KeywordSets,
    registry_count: usize,
) -> String {
    let show = |id: &Option<String>| match id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "No configurado".to_string(),
    };
    format!(
        "📊 *Estado del bot*\n\n\
         📥 Origen: {}\n\
         📤 Destino: {}\n\n\
         ❌ Palabras de cancelación: {}\n\
         📋 Palabras de solicitud: {}\n\n\
         🗂️ Pedidos registrados: {}\n\
         🚦 Listo para reenviar: {}",
        show(&routing.source),
        show(&routing.destination),
        keywords.cancellation.join(", "),
        keywords.solicitation.join(", "),
        registry_count,
        if routing.is_ready() { "Sí" } else { "No" },
    )
}
