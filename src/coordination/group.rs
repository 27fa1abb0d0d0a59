use crate::CoordinationError;

/// Checks that `group` is a well-formed group path.
///
/// A path is one or more non-empty segments of `[A-Za-z0-9._-]` joined by a
/// single `/`, e.g. `proxies/eu-west`.
pub fn validate_group(group: &str) -> Result<(), CoordinationError> {
    if group.is_empty() {
        return Err(CoordinationError::InvalidGroup(group.to_string()));
    }
    let valid = group.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    });
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::InvalidGroup(group.to_string()))
    }
}
