//! Request and response vocabulary.
//!
//! Keywords are case-sensitive. A request line is `<keyword>` or
//! `<keyword> <argument>`; the argument runs to the end of the line.

/// Split a wire line into keyword and (possibly empty) argument.
pub fn split_line(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((kw, arg)) => (kw, arg),
        None => (line, ""),
    }
}

// =============================================================================
// Requests (client -> server)
// =============================================================================

/// How a request moves the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Allowed before `Root` (negotiation).
    Preamble,
    /// Sets the session root.
    Root,
    /// Accumulates state for the next command; requires `Root`.
    Configuring,
    /// Terminal command request; requires `Root`.
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSpec {
    pub name: &'static str,
    pub class: RequestClass,
}

const fn req(name: &'static str, class: RequestClass) -> RequestSpec {
    RequestSpec { name, class }
}

use RequestClass::{Command, Configuring, Preamble, Root};

/// Every request this server understands.
pub const REQUESTS: &[RequestSpec] = &[
    req("Root", Root),
    req("Valid-responses", Preamble),
    req("valid-requests", Preamble),
    req("UseUnchanged", Preamble),
    req("Set", Preamble),
    req("Global_option", Preamble),
    req("Noop", Preamble),
    req("version", Preamble),
    req("Directory", Configuring),
    req("Max-dotdot", Configuring),
    req("Static-directory", Configuring),
    req("Sticky", Configuring),
    req("Entry", Configuring),
    req("Kopt", Configuring),
    req("Checkin-time", Configuring),
    req("Modified", Configuring),
    req("Is-modified", Configuring),
    req("Unchanged", Configuring),
    req("Questionable", Configuring),
    req("Argument", Configuring),
    req("Argumentx", Configuring),
    req("expand-modules", Command),
    req("add", Command),
    req("admin", Command),
    req("annotate", Command),
    req("checkout", Command),
    req("co", Command),
    req("commit", Command),
    req("ci", Command),
    req("diff", Command),
    req("edit", Command),
    req("history", Command),
    req("import", Command),
    req("init", Command),
    req("log", Command),
    req("rdiff", Command),
    req("remove", Command),
    req("rtag", Command),
    req("status", Command),
    req("tag", Command),
    req("unedit", Command),
    req("update", Command),
    req("watch-on", Command),
    req("watch-off", Command),
];

pub fn lookup_request(name: &str) -> Option<&'static RequestSpec> {
    REQUESTS.iter().find(|r| r.name == name)
}

/// Space-separated list for the `Valid-requests` response.
pub fn valid_requests() -> String {
    REQUESTS
        .iter()
        .map(|r| r.name)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Commands that modify the repository and therefore need write locks.
pub fn is_writing_command(name: &str) -> bool {
    matches!(
        name,
        "commit" | "ci" | "add" | "remove" | "tag" | "rtag" | "import" | "admin"
    )
}

// =============================================================================
// Responses (server -> client)
// =============================================================================

/// Responses this client understands, sent as `Valid-responses`.
pub const RESPONSES: &[&str] = &[
    "ok",
    "error",
    "Valid-requests",
    "Checked-in",
    "New-entry",
    "Checksum",
    "Copy-file",
    "Updated",
    "Created",
    "Update-existing",
    "Merged",
    "Patched",
    "Rcs-diff",
    "Mode",
    "Mod-time",
    "Removed",
    "Remove-entry",
    "Set-static-directory",
    "Clear-static-directory",
    "Set-sticky",
    "Clear-sticky",
    "Template",
    "Notified",
    "Module-expansion",
    "M",
    "Mbinary",
    "E",
    "F",
    "MT",
];

pub fn valid_responses() -> String {
    RESPONSES.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_line() {
        assert_eq!(split_line("Root /repo"), ("Root", "/repo"));
        assert_eq!(split_line("update"), ("update", ""));
        assert_eq!(split_line("Argument -m two words"), ("Argument", "-m two words"));
    }

    #[test]
    fn test_lookup() {
        assert_eq!(lookup_request("Root").unwrap().class, RequestClass::Root);
        assert_eq!(lookup_request("update").unwrap().class, RequestClass::Command);
        assert_eq!(lookup_request("Entry").unwrap().class, RequestClass::Configuring);
        assert!(lookup_request("root").is_none());
    }

    #[test]
    fn test_valid_lists_are_unique() {
        let mut names: Vec<_> = REQUESTS.iter().map(|r| r.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REQUESTS.len());
        assert!(valid_requests().starts_with("Root "));
        assert!(valid_responses().contains("Mod-time"));
    }
}
