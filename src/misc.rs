use std::time::Duration;

pub(crate) mod app_infos {
    use package_info::PackageInfo;
    use package_info_derive::PackageInfo;

    #[derive(PackageInfo)]
    struct CargoPackageInfo {}

    pub fn name() -> String {
        CargoPackageInfo::name().unwrap_or("unknown-package".to_string())
    }
}

pub fn hostname() -> String {
    hostname::get()
        .ok()
        .map(|name| format!("{}", name.to_str().unwrap_or("")))
        .unwrap_or("localhost".to_string())
}

/// A terse, human-friendly rendering for durations used in log lines
/// (backoff delays, schedule intervals).
pub trait HumanReadable {
    fn prettify(&self) -> String;
}

impl HumanReadable for Duration {
    fn prettify(&self) -> String {
        let secs = self.as_secs();
        if secs == 0 {
            return format!("{}ms", self.as_millis());
        }
        if secs < 60 {
            return format!("{secs}s");
        }
        if secs < 3600 {
            return format!("{}m{}s", secs / 60, secs % 60);
        }
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
