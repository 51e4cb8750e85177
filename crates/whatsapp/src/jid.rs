use wagate_config::WhatsAppConfig;

/// Turns phone numbers as typed by users into network addresses.
#[derive(Debug, Clone)]
pub struct JidFormat {
    country_code: String,
    user_domain: String,
}

impl JidFormat {
    pub fn new(country_code: impl Into<String>, user_domain: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
            user_domain: user_domain.into(),
        }
    }

    /// Drop the first character (the local trunk prefix), prepend the
    /// country code and append the user domain.
    ///
    /// `081234567890` becomes `6281234567890@s.whatsapp.net`.
    pub fn user(&self, number: &str) -> String {
        let mut chars = number.chars();
        chars.next();
        format!("{}{}@{}", self.country_code, chars.as_str(), self.user_domain)
    }
}

impl Default for JidFormat {
    fn default() -> Self {
        Self::from(&WhatsAppConfig::default())
    }
}

impl From<&WhatsAppConfig> for JidFormat {
    fn from(cfg: &WhatsAppConfig) -> Self {
        Self::new(cfg.country_code.clone(), cfg.user_domain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_number() {
        assert_eq!(
            JidFormat::default().user("081234567890"),
            "6281234567890@s.whatsapp.net"
        );
    }

    #[test]
    fn custom_country() {
        let fmt = JidFormat::new("44", "s.whatsapp.net");
        assert_eq!(fmt.user("07700900123"), "447700900123@s.whatsapp.net");
    }

    #[test]
    fn single_character_number() {
        assert_eq!(JidFormat::default().user("0"), "62@s.whatsapp.net");
    }
}
