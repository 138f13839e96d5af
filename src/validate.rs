//! Identifier discipline for aliases, envelope ids and stream ids.

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{custody_err, ErrorKind};

const ALIAS_PATTERN: &str = r"^[a-z0-9][a-z0-9._-]{0,63}$";
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$";

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<&'static Regex> {
    if let Some(re) = cell.get() {
        return Ok(re);
    }
    let re = Regex::new(pattern)?;
    Ok(cell.get_or_init(|| re))
}

/// Master key aliases are lowercase and never contain `:`, which is reserved
/// for the `<alias>:v<version>` names of retired keys.
pub fn validate_alias(alias: &str) -> Result<()> {
    static ALIAS_RE: OnceLock<Regex> = OnceLock::new();
    if !compiled(&ALIAS_RE, ALIAS_PATTERN)?.is_match(alias) {
        return Err(custody_err(
            ErrorKind::InvalidInput,
            format!("alias {:?} must match {}", alias, ALIAS_PATTERN),
        ));
    }
    Ok(())
}

/// Caller supplied ids (envelopes, streams).
pub fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    static IDENTIFIER_RE: OnceLock<Regex> = OnceLock::new();
    if !compiled(&IDENTIFIER_RE, IDENTIFIER_PATTERN)?.is_match(id) {
        return Err(custody_err(
            ErrorKind::InvalidInput,
            format!("{} id {:?} must match {}", kind, id, IDENTIFIER_PATTERN),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_reject_reserved_separator() {
        assert!(validate_alias("evidence-key").is_ok());
        assert!(validate_alias("evidence-key:v1").is_err());
        assert!(validate_alias("Evidence").is_err());
        assert!(validate_alias("").is_err());
    }

    #[test]
    fn identifiers_allow_namespaced_ids() {
        assert!(validate_identifier("envelope", "case-42:exhibit.7").is_ok());
        assert!(validate_identifier("stream", "s1").is_ok());
        assert!(validate_identifier("stream", "bad id").is_err());
        assert!(validate_identifier("stream", "../etc").is_err());
    }
}
