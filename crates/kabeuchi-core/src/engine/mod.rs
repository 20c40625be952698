// Kabeuchi Engine — everything with side effects
// Config loading, credential acquisition, the HTTP transport and the
// dispatcher that ties them together.

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod extract;
pub mod http;
pub mod negotiation;
