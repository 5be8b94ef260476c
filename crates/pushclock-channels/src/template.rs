//! Time placeholder substitution for titles and bodies.
//!
//! Substitution is purely textual: `{{name}}` tokens outside the fixed set
//! are left as they are, so rendering twice gives the same text.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};

/// Replace every known `{{placeholder}}` using `now` as the clock.
pub fn render<Tz: TimeZone>(text: &str, now: &DateTime<Tz>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let local = now.naive_local();
    let values = [
        ("{{date}}", local.format("%Y-%m-%d").to_string()),
        ("{{time}}", local.format("%H:%M:%S").to_string()),
        ("{{datetime}}", local.format("%Y-%m-%d %H:%M:%S").to_string()),
        ("{{year}}", local.year().to_string()),
        ("{{month}}", format!("{:02}", local.month())),
        ("{{day}}", format!("{:02}", local.day())),
        ("{{hour}}", format!("{:02}", local.hour())),
        ("{{minute}}", format!("{:02}", local.minute())),
        ("{{second}}", format!("{:02}", local.second())),
        ("{{weekday}}", weekday_en(local.weekday()).to_string()),
        ("{{weekday_cn}}", weekday_cn(local.weekday()).to_string()),
        ("{{timestamp}}", now.timestamp().to_string()),
    ];

    let mut out = text.to_string();
    for (token, value) in &values {
        if out.contains(token) {
            out = out.replace(token, value);
        }
    }
    out
}

fn weekday_en(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn weekday_cn(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "星期一",
        Weekday::Tue => "星期二",
        Weekday::Wed => "星期三",
        Weekday::Thu => "星期四",
        Weekday::Fri => "星期五",
        Weekday::Sat => "星期六",
        Weekday::Sun => "星期日",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 5, 7).unwrap()
    }

    #[test]
    fn test_date_and_time() {
        assert_eq!(
            render("Run at {{date}} {{time}}", &clock()),
            "Run at 2024-01-02 09:05:07"
        );
    }

    #[test]
    fn test_no_placeholders_unchanged() {
        let text = "plain text with {braces} and {{ spaced }}";
        assert_eq!(render(text, &clock()), text);
    }

    #[test]
    fn test_unknown_placeholder_left_alone() {
        assert_eq!(render("{{date}} {{user}}", &clock()), "2024-01-02 {{user}}");
    }

    #[test]
    fn test_components_and_weekday() {
        let out = render(
            "{{year}}/{{month}}/{{day}} {{hour}}h{{minute}}m{{second}}s {{weekday}} {{weekday_cn}}",
            &clock(),
        );
        assert_eq!(out, "2024/01/02 09h05m07s Tuesday 星期二");
    }

    #[test]
    fn test_timestamp_and_datetime() {
        let out = render("{{datetime}}|{{timestamp}}", &clock());
        assert_eq!(out, format!("2024-01-02 09:05:07|{}", clock().timestamp()));
    }

    #[test]
    fn test_render_in_local_zone() {
        let shanghai = clock().with_timezone(&chrono_tz::Asia::Shanghai);
        assert_eq!(render("{{time}}", &shanghai), "17:05:07");
    }

    #[test]
    fn test_idempotent() {
        let once = render("{{date}} {{nope}}", &clock());
        assert_eq!(render(&once, &clock()), once);
    }
}
