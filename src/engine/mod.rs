// Carretón Relay — transport side of the engine
//
//   whatsapp — Evolution API protocol client and webhook translation
//   listener — webhook intake and monitoring HTTP listener

pub mod listener;
pub mod whatsapp;
