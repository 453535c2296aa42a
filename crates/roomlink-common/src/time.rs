//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Shared primitives and utilities for the bus controller."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use chrono::{Local, NaiveDateTime, Utc};
use roomlink_msg::BcdDateTime;

/// Local wall-clock time as stamped into log records and clock broadcasts.
pub fn bcd_now_local() -> BcdDateTime {
    BcdDateTime::from(Local::now().naive_local())
}

/// UTC wall-clock time.
pub fn bcd_now_utc() -> BcdDateTime {
    BcdDateTime::from(Utc::now().naive_utc())
}

/// Twelve `YYMMDDhhmmss` digits, the argument format of the set-clock command.
pub fn clock_digits(at: NaiveDateTime) -> String {
    at.format("%y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn clock_digits_match_bcd_encoding() {
        let at = NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap();
        let digits = clock_digits(at);
        assert_eq!(digits, "261019070809");
        assert_eq!(BcdDateTime::from_digits(&digits), Some(BcdDateTime::from(at)));
    }

    #[test]
    fn now_is_valid_bcd() {
        assert!(bcd_now_local().is_valid());
        assert!(bcd_now_utc().is_valid());
    }
}
