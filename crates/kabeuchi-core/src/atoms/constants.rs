// ── Kabeuchi Atoms: Constants ──────────────────────────────────────────────
// All named constants for the dispatch engine live here.

// ── Remote agent protocol ─────────────────────────────────────────────────
// The hosted agent service moves its api-version faster than we ship.
// The configured version is tried first, then this list, newest first.
pub const DEFAULT_API_VERSION: &str = "2025-11-15-preview";

pub const FALLBACK_API_VERSIONS: &[&str] = &[
    "2025-11-15-preview",
    "2025-05-15-preview",
    "2025-05-01",
    "2025-04-01-preview",
    "2025-03-01-preview",
];

/// Version string sent with the `/openai/v1/...` URL shape, tried last.
pub const V1_PREVIEW_API_VERSION: &str = "preview";

/// Token scope for the hosted agent service.
pub const DEFAULT_TOKEN_SCOPE: &str = "https://ai.azure.com/.default";

/// Body `agent.type` discriminator for a named agent reference.
pub const AGENT_REFERENCE_TYPE: &str = "agent_reference";

// ── Negotiation failure markers ───────────────────────────────────────────
// Lowercase substrings. A rejected attempt whose body contains any of these
// is a version problem, so the next variant is worth trying.
pub const NEGOTIATION_MARKERS: &[&str] = &[
    "version not supported",
    "version is not supported",
    "unsupported api version",
    "unsupported api-version",
    "apiversionnotsupported",
    "invalidapiversionparameter",
    "invalid api version",
    "invalid api-version",
    "missing version parameter",
    "missing api version",
    "missing api-version",
    "missing required query parameter 'api-version'",
    "api-version query parameter is required",
];

// The service usually quotes the rejected value mid-sentence
// ("The api-version '2099-01-01' is not supported"), so a body that names
// the parameter anywhere and also carries a problem word counts too.
pub const API_VERSION_SUBJECTS: &[&str] = &["api-version", "api version", "apiversion"];

pub const API_VERSION_PROBLEMS: &[&str] = &[
    "not supported",
    "unsupported",
    "invalid",
    "missing",
    "required",
];

// ── Tool usage markers ────────────────────────────────────────────────────
// Exact `type` values that mean a tool actually ran. Anything ending in
// TOOL_CALL_SUFFIX also counts.
pub const TOOL_TYPE_MARKERS: &[&str] = &[
    "file_search",
    "openapi",
    "mcp",
    "tool_call",
    "function_call",
];

pub const TOOL_CALL_SUFFIX: &str = "_call";

/// Response keys that echo the tool *configuration* rather than invocations.
pub const OFFERED_TOOL_KEYS: &[&str] = &["tools", "tool_choice"];

// ── Time budgets ──────────────────────────────────────────────────────────
/// Total budget for the whole attempt sequence, shared by every variant.
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout for the shared client.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Cached tokens are refreshed this long before they expire.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Upper bound on the Azure CLI token command.
pub const CLI_TOKEN_TIMEOUT_SECS: u64 = 20;

// ── Caller limits ─────────────────────────────────────────────────────────
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Bodies are cut to this many bytes in log lines and error messages.
pub const LOG_BODY_LIMIT: usize = 500;
