//! Pre-execution block-list: obviously dangerous patterns in user code
//! are rejected before anything is spawned or sent to the sandbox.

use once_cell::sync::Lazy;
use regex::Regex;

/// Process-spawning and shell-escape primitives. The sandbox is expected
/// to confine code anyway; this is the cheap first gate.
static BLOCKED: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bimport\s+subprocess\b", "subprocess import"),
        (r"\bfrom\s+subprocess\b", "subprocess import"),
        (r"\bsubprocess\s*\.", "subprocess call"),
        (r"\bos\.system\s*\(", "os.system"),
        (r"\bos\.popen\s*\(", "os.popen"),
        (r"\bos\.exec\w*\s*\(", "os.exec*"),
        (r"\bos\.spawn\w*\s*\(", "os.spawn*"),
        (r"\bos\.fork\s*\(", "os.fork"),
        (r"\bpty\.spawn\s*\(", "pty.spawn"),
        (r"\bPopen\s*\(", "Popen"),
        (r"\bcommands\.getoutput\s*\(", "commands.getoutput"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("static pattern"), label))
    .collect()
});

/// Returns the first blocked pattern found in `code`, if any.
pub fn find_blocked_pattern(code: &str) -> Option<&'static str> {
    BLOCKED
        .iter()
        .find(|(regex, _)| regex.is_match(code))
        .map(|(_, label)| *label)
}
