use chrono::{DateTime, TimeZone, Timelike};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeText {
    pub spoken: String,
    pub display: String,
}

fn primary_subtag(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Locale default: 12-hour for English outside the British Isles.
pub fn locale_uses_24_hour(language: &str) -> bool {
    let mut parts = language.split(['-', '_']);
    let primary = parts.next().unwrap_or_default().to_ascii_lowercase();
    let region = parts.next().unwrap_or_default().to_ascii_uppercase();
    !(primary == "en" && region != "GB" && region != "IE")
}

pub fn format_time<Tz: TimeZone>(
    time: &DateTime<Tz>,
    language: &str,
    use_24_hour: Option<bool>,
) -> TimeText {
    let local = time.naive_local();
    let (hour, minute) = (local.hour(), local.minute());
    let twenty_four = use_24_hour.unwrap_or_else(|| locale_uses_24_hour(language));

    let (shown_hour, suffix) = if twenty_four {
        (hour, "")
    } else {
        let h12 = match hour % 12 {
            0 => 12,
            h => h,
        };
        (h12, if hour < 12 { " AM" } else { " PM" })
    };

    let display = if twenty_four {
        format!("{hour:02}:{minute:02}")
    } else {
        format!("{shown_hour}:{minute:02}{suffix}")
    };

    let lang = primary_subtag(language);
    // Spoken day period in the announcement language; English keeps AM/PM.
    let period = if twenty_four {
        ""
    } else if lang == "en" {
        suffix
    } else {
        day_period(&lang, hour)
    };
    let clock = if twenty_four {
        display.clone()
    } else if minute == 0 {
        format!("{shown_hour}{period}")
    } else {
        format!("{shown_hour}:{minute:02}{period}")
    };

    let spoken = match lang.as_str() {
        "en" => format!("It's {clock}"),
        "de" if minute == 0 => format!("Es ist {shown_hour} Uhr{period}"),
        "de" => format!("Es ist {shown_hour} Uhr {minute}{period}"),
        "fr" if minute == 0 => format!("Il est {shown_hour} heures{period}"),
        "fr" => format!("Il est {shown_hour} heures {minute}{period}"),
        "es" if shown_hour == 1 => format!("Es la {clock}"),
        "es" => format!("Son las {clock}"),
        _ => clock,
    };

    TimeText { spoken, display }
}

fn day_period(lang: &str, hour: u32) -> &'static str {
    match (lang, hour) {
        ("de", 0..=4) => " nachts",
        ("de", 5..=11) => " morgens",
        ("de", 12..=17) => " nachmittags",
        ("de", _) => " abends",
        ("fr", 0..=11) => " du matin",
        ("fr", 12..=17) => " de l'après-midi",
        ("fr", _) => " du soir",
        ("es", 0..=11) => " de la mañana",
        ("es", 12..=19) => " de la tarde",
        ("es", _) => " de la noche",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    #[test]
    fn us_english_uses_twelve_hour_clock() {
        let text = format_time(&at(10, 15), "en-US", None);
        assert_eq!(text.display, "10:15 AM");
        assert_eq!(text.spoken, "It's 10:15 AM");

        let text = format_time(&at(22, 0), "en-US", None);
        assert_eq!(text.display, "10:00 PM");
        assert_eq!(text.spoken, "It's 10 PM");
    }

    #[test]
    fn midnight_and_noon_in_twelve_hour_clock() {
        assert_eq!(format_time(&at(0, 5), "en-US", None).display, "12:05 AM");
        assert_eq!(format_time(&at(12, 5), "en-US", None).display, "12:05 PM");
    }

    #[test]
    fn other_locales_default_to_twenty_four_hours() {
        let text = format_time(&at(22, 15), "de-DE", None);
        assert_eq!(text.display, "22:15");
        assert_eq!(text.spoken, "Es ist 22 Uhr 15");

        assert_eq!(format_time(&at(7, 0), "fr-FR", None).spoken, "Il est 7 heures");
        assert_eq!(format_time(&at(13, 5), "es", None).spoken, "Son las 13:05");
        assert_eq!(format_time(&at(13, 5), "ja-JP", None).spoken, "13:05");
        assert_eq!(format_time(&at(9, 30), "en-GB", None).display, "09:30");
    }

    #[test]
    fn explicit_preference_overrides_locale() {
        assert_eq!(format_time(&at(22, 15), "en-US", Some(true)).display, "22:15");
        assert_eq!(format_time(&at(22, 15), "de-DE", Some(false)).display, "10:15 PM");
    }

    #[test]
    fn twelve_hour_speech_uses_the_announcement_language() {
        let text = format_time(&at(22, 15), "de-DE", Some(false));
        assert_eq!(text.spoken, "Es ist 10 Uhr 15 abends");
        assert!(!text.spoken.contains("PM"));

        assert_eq!(
            format_time(&at(7, 0), "fr-FR", Some(false)).spoken,
            "Il est 7 heures du matin"
        );
        assert_eq!(
            format_time(&at(13, 5), "es-ES", Some(false)).spoken,
            "Es la 1:05 de la tarde"
        );
        assert_eq!(
            format_time(&at(21, 0), "es", Some(false)).spoken,
            "Son las 9 de la noche"
        );
        assert_eq!(format_time(&at(22, 15), "ja-JP", Some(false)).spoken, "10:15");
        assert_eq!(format_time(&at(22, 0), "en-US", None).spoken, "It's 10 PM");
    }
}
