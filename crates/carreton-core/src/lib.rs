// Carretón Core — WhatsApp relay engine
//
// Layering:
//   atoms  — constants, error type, domain types, the protocol client trait
//   engine — connection controller, classifier, registry, command dispatcher,
//            routing engine and the single-consumer session loop that owns them
//
// Nothing in this crate performs network I/O directly; all traffic goes
// through an implementation of `atoms::traits::ProtocolClient`.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::traits::ProtocolClient;
pub use engine::session::{
    session_queue, spawn_session, spawn_session_with_queue, SessionExit, SessionHandle,
    SessionSettings,
};
