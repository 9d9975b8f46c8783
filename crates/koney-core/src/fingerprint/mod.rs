//! Fingerprint codec for self-induced decoy accesses.
//!
//! The controller's own exec writes would trip the kernel probes it
//! installs. To tell them apart from attacker accesses, every
//! decoy-producing command embeds a short code in its arguments, in one
//! of two encodings: a plain marker for `echo`-style commands and a
//! binary encoding as `-u`/`-uu` flags for `cat`-style commands (both
//! inert for those binaries). The ingestion pipeline drops any event
//! whose process arguments carry either form.

/// The process-wide fingerprint code.
// TODO: randomize on startup and share with the forwarder deployment.
pub const DEFAULT_FINGERPRINT_CODE: u32 = 1337;

/// Marker prefix of the echo-form encoding.
pub const ECHO_MARKER_PREFIX: &str = "KONEY_FINGERPRINT_";

/// Encode the fingerprint for echo commands.
#[must_use]
pub fn encode_in_echo(code: u32) -> String {
    format!("{ECHO_MARKER_PREFIX}{code}")
}

/// Encode the fingerprint for cat commands: the big-endian binary form
/// of the code, one `-u` token per zero bit and one `-uu` per one bit.
#[must_use]
pub fn encode_in_cat(code: u32) -> String {
    let binary = format!("{code:b}");
    let tokens: Vec<&str> = binary
        .chars()
        .map(|bit| if bit == '0' { "-u" } else { "-uu" })
        .collect();
    tokens.join(" ")
}

/// Whether a process argument string carries either encoding of the
/// given code.
#[must_use]
pub fn arguments_carry_fingerprint(arguments: &str, code: u32) -> bool {
    arguments.contains(&encode_in_echo(code)) || arguments.contains(&encode_in_cat(code))
}
