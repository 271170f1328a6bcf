use std::error::Error;
use std::fmt;

/// Renders an error and its source chain on a single line.
///
/// Multi-line `Display` output is unusable inside structured log fields, so
/// log sites use `err = %e.fmt_compact()` instead of `%e`.
pub struct CompactError<'e, E>(&'e E);

impl<E> fmt::Display for CompactError<'_, E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    type Fmt<'e>: fmt::Display
    where
        Self: 'e;

    fn fmt_compact(&self) -> Self::Fmt<'_>;
}

impl<E> FmtCompact for E
where
    E: Error,
{
    type Fmt<'e>
        = CompactError<'e, E>
    where
        E: 'e;

    fn fmt_compact(&self) -> Self::Fmt<'_> {
        CompactError(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("outer")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn chains_sources_on_one_line() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        assert_eq!(err.fmt_compact().to_string(), "outer: inner");
    }
}
