use crate::error::{Error, Result};

/// Advances the minute field of a 5 field cron expression by one, wrapping
/// within the hour: `"59 6 * * *"` becomes `"0 6 * * *"`. Only a plain
/// numeric minute is accepted.
pub fn cycle_minute(expr: &str) -> Result<String> {
    let malformed = |reason: &str| Error::MalformedCron {
        expr: expr.to_owned(),
        reason: reason.to_owned(),
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, rest @ ..] = fields.as_slice() else {
        return Err(malformed("expected 5 fields"));
    };
    if fields.len() != 5 {
        return Err(malformed("expected 5 fields"));
    }

    if minute.is_empty() || !minute.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("minute must be a number"));
    }
    let minute: u32 = minute
        .parse()
        .map_err(|_| malformed("minute must be a number"))?;
    if minute >= 60 {
        return Err(malformed("minute must be in 0..=59"));
    }

    let next = ((minute + 1) % 60).to_string();
    Ok(std::iter::once(next.as_str())
        .chain(rest.iter().copied())
        .collect::<Vec<_>>()
        .join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_minute() {
        let cases = [
            ("0 * * * *", "1 * * * *"),
            ("1 * * * *", "2 * * * *"),
            ("30 * * * *", "31 * * * *"),
            ("58 * * * *", "59 * * * *"),
            ("59 * * * *", "0 * * * *"),
            ("0 6 * * *", "1 6 * * *"),
            ("1 2 3 4 5", "2 2 3 4 5"),
            ("1 2 3 4 sun", "2 2 3 4 sun"),
            ("1  2 3\t4 5", "2 2 3 4 5"),
        ];
        for (input, want) in cases {
            assert_eq!(cycle_minute(input).unwrap(), want, "cycle_minute({input:?})");
        }
    }

    #[test]
    fn any_whitespace_separates_fields() {
        assert_eq!(cycle_minute(" 0 6 * * *").unwrap(), "1 6 * * *");
        assert_eq!(cycle_minute("0 6 * * * ").unwrap(), "1 6 * * *");
        assert_eq!(cycle_minute("0\t6  *\n* *").unwrap(), "1 6 * * *");
        assert!(cycle_minute(" ").is_err());
    }

    #[test]
    fn rejects_malformed() {
        for input in [
            "@hourly",
            "-1 * * * *",
            "60 * * * *",
            "+1 * * * *",
            "1,2 * * * *",
            "*/5 * * * *",
            "0-10 * * * *",
            "* * * * *",
            "0 * * *",
            "0 * * * * *",
            "",
        ] {
            assert!(
                matches!(cycle_minute(input), Err(Error::MalformedCron { .. })),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn sixty_cycles_return_to_start() {
        for start in ["0 6 * * *", "17 * * * mon", "59 0 1 1 *"] {
            let mut expr = start.to_owned();
            for _ in 0..60 {
                expr = cycle_minute(&expr).unwrap();
            }
            assert_eq!(expr, start);
        }
    }
}
