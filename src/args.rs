use std::str::FromStr;

use bytes::Bytes;

/// Finds a named option in a command's argument list and parses the value
/// that follows it, e.g. `PX 100` in a SET. Matching is case-insensitive;
/// a present name with a missing or unparseable value is `Err`.
pub fn named_option<R: FromStr>(args: &[Bytes], name: &str) -> anyhow::Result<Option<R>>
where
    R::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(i) = position(args, name) else {
        return Ok(None);
    };
    let value = args
        .get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("option {} is missing a value", name))?;
    let value = std::str::from_utf8(value)?;
    Ok(Some(value.parse::<R>()?))
}

/// Everything after a named marker, e.g. the key/id list after `STREAMS`.
pub fn named_option_list<'a>(args: &'a [Bytes], name: &str) -> Option<&'a [Bytes]> {
    position(args, name).map(|i| &args[i + 1..])
}

fn position(args: &[Bytes], name: &str) -> Option<usize> {
    args.iter()
        .position(|arg| arg.eq_ignore_ascii_case(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[test]
    fn finds_option_case_insensitively() {
        let args = args(&["v", "px", "100"]);
        assert_eq!(named_option::<u64>(&args, "PX").unwrap(), Some(100));
    }

    #[test]
    fn absent_option_is_none() {
        let args = args(&["v"]);
        assert_eq!(named_option::<u64>(&args, "PX").unwrap(), None);
    }

    #[test]
    fn bad_value_is_an_error() {
        let args = args(&["v", "PX", "soon"]);
        assert!(named_option::<u64>(&args, "PX").is_err());
    }

    #[test]
    fn list_takes_everything_after_marker() {
        let args = args(&["BLOCK", "0", "STREAMS", "a", "b", "0-0", "0-0"]);
        let tail = named_option_list(&args, "streams").unwrap();
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].as_ref(), b"a");
    }
}
