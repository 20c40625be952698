// Kabeuchi Commands — thin HTTP handlers
// Extract state → call the dispatcher → shape the JSON. No agent logic here.

pub mod chat;
pub mod diagnostics;
