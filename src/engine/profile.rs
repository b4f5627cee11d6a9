/// Fixed argument profile every engine process is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub locale: String,
    pub timezone: Option<String>,
}

impl LaunchProfile {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--no-sandbox".to_string()];
        if self.headless {
            args.push("--headless=new".to_string());
            args.push("--no-zygote".to_string());
        }
        args.extend([
            format!("--window-size={},{}", self.window_width, self.window_height),
            "--disable-web-security".to_string(),
            "--disable-features=IsolateOrigins,site-per-process".to_string(),
            "--ignore-certificate-errors".to_string(),
            format!("--lang={}", self.locale),
        ]);
        args
    }
}

impl Default for LaunchProfile {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1600,
            window_height: 1200,
            locale: "nl-NL,nl".to_string(),
            timezone: Some("Europe/Amsterdam".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_arguments() {
        insta::assert_debug_snapshot!(LaunchProfile::default().args(), @r#"
        [
            "--no-sandbox",
            "--headless=new",
            "--no-zygote",
            "--window-size=1600,1200",
            "--disable-web-security",
            "--disable-features=IsolateOrigins,site-per-process",
            "--ignore-certificate-errors",
            "--lang=nl-NL,nl",
        ]
        "#);
    }

    #[test]
    fn headed_profile_keeps_zygote() {
        let profile = LaunchProfile {
            headless: false,
            ..LaunchProfile::default()
        };
        let args = profile.args();
        assert!(!args.iter().any(|arg| arg == "--no-zygote"));
        assert!(!args.iter().any(|arg| arg.starts_with("--headless")));
        assert_eq!(args.first().map(String::as_str), Some("--no-sandbox"));
    }
}
