//! Parsing and sanitization of SSH exec payloads.
//!
//! An exec request carries a single line such as:
//!
//! ```text
//! git-upload-pack 'org/project.git'
//! git receive-pack 'project.git'
//! ```
//!
//! Only the three smart-transport subcommands are accepted, and the
//! quoted path is canonicalized so it can never escape the repositories
//! root, whatever the client sends.

use crate::{Error, Result};

const SUBCOMMANDS: [&str; 3] = ["upload-pack", "upload-archive", "receive-pack"];

/// A parsed smart-transport request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// The verb exactly as the client sent it, e.g. `git-upload-pack`
    /// or `git upload-pack`.
    pub verb: String,
    /// Repository path relative to the repositories root. Never starts
    /// with `/` and never contains `..` segments.
    pub repo: String,
    /// The payload the verb and path were parsed from.
    pub original: String,
}

/// Strip transport noise from a raw exec payload: everything before the
/// first occurrence of `git`, leading quote/parenthesis characters, and
/// embedded NUL bytes.
pub fn clean_command(raw: &str) -> String {
    let cmd = match raw.find("git") {
        Some(i) => &raw[i..],
        None => raw,
    };
    let cmd = cmd.trim_start_matches(['\'', '(', ')']);
    cmd.replace('\0', "")
}

/// Parse a cleaned exec payload into a [`GitCommand`].
///
/// The payload must be, in full: the verb (`git-<sub>` or `git <sub>`),
/// one space, and the repository path in single quotes. Anything else is
/// [`Error::InvalidCommand`].
pub fn parse(cmd: &str) -> Result<GitCommand> {
    let rest = cmd.strip_prefix("git").ok_or(Error::InvalidCommand)?;

    let sep = match rest.as_bytes().first() {
        Some(b'-') => '-',
        Some(b' ') => ' ',
        _ => return Err(Error::InvalidCommand),
    };
    let rest = &rest[1..];

    let sub = SUBCOMMANDS
        .iter()
        .find(|sub| rest.starts_with(**sub))
        .ok_or(Error::InvalidCommand)?;
    let rest = &rest[sub.len()..];

    let path = rest
        .strip_prefix(" '")
        .and_then(|quoted| quoted.strip_suffix('\''))
        .ok_or(Error::InvalidCommand)?;

    Ok(GitCommand {
        verb: format!("git{sep}{sub}"),
        repo: sanitize_path(path),
        original: cmd.to_string(),
    })
}

/// Canonicalize a client-supplied path so it stays below the
/// repositories root: resolved as if rooted at `/` (empty and `.`
/// segments dropped, `..` pops without ever rising above the root),
/// then returned without the leading slash.
fn sanitize_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    stack.join("/")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hyphenated_verbs() {
        for verb in [
            "git-upload-pack",
            "git-upload-archive",
            "git-receive-pack",
        ] {
            let cmd = parse(&format!("{verb} 'project.git'")).unwrap();
            assert_eq!(cmd.verb, verb);
            assert_eq!(cmd.repo, "project.git");
        }
    }

    #[test]
    fn parse_space_verb_is_preserved() {
        let cmd = parse("git upload-pack 'project.git'").unwrap();
        assert_eq!(cmd.verb, "git upload-pack");
        assert_eq!(cmd.repo, "project.git");
    }

    #[test]
    fn parse_keeps_original_payload() {
        let payload = "git-receive-pack 'org/project.git'";
        let cmd = parse(payload).unwrap();
        assert_eq!(cmd.original, payload);
        assert_eq!(cmd.repo, "org/project.git");
    }

    #[test]
    fn parse_strips_leading_slash() {
        let cmd = parse("git-upload-pack '/project.git'").unwrap();
        assert_eq!(cmd.repo, "project.git");
    }

    #[test]
    fn parse_contains_traversal() {
        let cmd = parse("git-upload-pack '../etc/passwd'").unwrap();
        assert_eq!(cmd.repo, "etc/passwd");

        let cmd = parse("git-upload-pack 'a/../../../../secret.git'").unwrap();
        assert_eq!(cmd.repo, "secret.git");

        let cmd = parse("git-upload-pack 'a/./b//c.git'").unwrap();
        assert_eq!(cmd.repo, "a/b/c.git");
    }

    #[test]
    fn parse_rejects_garbage() {
        for input in [
            "",
            "ls -la",
            "git-upload-pack project.git",
            "git-upload-pack 'project.git' --extra",
            "git-push 'project.git'",
            "git_upload-pack 'project.git'",
            "upload-pack 'project.git'",
        ] {
            assert!(matches!(parse(input), Err(Error::InvalidCommand)), "{input:?}");
        }
    }

    #[test]
    fn clean_command_discards_prefixes() {
        assert_eq!(
            clean_command("'()git-upload-pack 'x.git'"),
            "git-upload-pack 'x.git'"
        );
        assert_eq!(
            clean_command("\x00\x0bgit-upload-pack 'x.git'"),
            "git-upload-pack 'x.git'"
        );
        assert_eq!(clean_command("no match here"), "no match here");
    }

    #[test]
    fn clean_then_parse_never_panics_on_noise() {
        for input in ["\x00\x00\x00\x0egit", "git-", "git-upload-pack '", "('('("] {
            let _ = parse(&clean_command(input));
        }
    }
}
