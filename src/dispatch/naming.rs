// src/dispatch/naming.rs

use crate::request::{preferred_os_dimension, TaskSpec};

/// `[prefix] title[ on OS]`.
///
/// The OS suffix is omitted when it would add nothing: the OS is the
/// preferred one for the host platform, equals the platform name, or is
/// already part of the title. `|` (dimension OR) is spelled out as ` or `.
pub fn step_name(prefix: &str, spec: &TaskSpec, host_platform: Option<&str>) -> String {
    let prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("[{prefix}] ")
    };

    let task_os = spec.os().unwrap_or_default().replace('|', " or ");
    let redundant = match host_platform {
        Some(platform) => {
            preferred_os_dimension(platform) == Some(task_os.as_str())
                || task_os.eq_ignore_ascii_case(platform)
        }
        None => false,
    } || task_os.is_empty()
        || spec.title.contains(&task_os);

    if redundant {
        format!("{prefix}{}", spec.title)
    } else {
        format!("{prefix}{} on {task_os}", spec.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{build_task_spec, BuildInfo, EngineDefaults, TaskParams};

    fn spec_on(title: &str, os: &str) -> TaskSpec {
        let mut params = TaskParams::new(title, vec!["./t".into()]);
        params.dimensions.insert("os".into(), Some(os.into()));
        build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params).unwrap()
    }

    #[test]
    fn os_suffix_added_for_foreign_os() {
        let spec = spec_on("unit_tests", "Windows-10");
        assert_eq!(step_name("", &spec, Some("linux")), "unit_tests on Windows-10");
        assert_eq!(
            step_name("trigger", &spec, Some("linux")),
            "[trigger] unit_tests on Windows-10"
        );
    }

    #[test]
    fn os_suffix_omitted_for_preferred_os() {
        let spec = spec_on("unit_tests", "Ubuntu-16.04");
        assert_eq!(step_name("", &spec, Some("linux")), "unit_tests");
    }

    #[test]
    fn or_dimension_is_spelled_out() {
        let spec = spec_on("unit_tests", "Mac-10.13|Mac-10.14");
        assert_eq!(
            step_name("", &spec, Some("linux")),
            "unit_tests on Mac-10.13 or Mac-10.14"
        );
    }
}
