/// Environment hygiene for payload processes.
///
/// Children never inherit the service's environment. They get a fixed,
/// deterministic base plus the profile's own variables, minus anything that
/// can steer the dynamic loader.
use std::collections::BTreeMap;
use std::path::Path;

pub const DETERMINISTIC_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Variables that can redirect the dynamic loader or glibc internals.
pub fn is_dangerous_var(name: &str) -> bool {
    name.starts_with("LD_")
        || matches!(
            name,
            "GCONV_PATH" | "HOSTALIASES" | "LOCALDOMAIN" | "MALLOC_TRACE" | "NLSPATH" | "RESOLV_HOST_CONF"
        )
}

/// Build the complete environment for one step.
///
/// `home` is the step's writable directory (the scope, or the container's
/// working directory); it doubles as TMPDIR so payloads never touch a
/// shared temp directory.
pub fn step_environment(home: &Path, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let home = home.to_string_lossy().into_owned();
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), DETERMINISTIC_PATH.to_string());
    env.insert("HOME".to_string(), home.clone());
    env.insert("TMPDIR".to_string(), home);
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());

    for (key, value) in extra {
        if is_dangerous_var(key) {
            log::warn!("Dropping loader variable {} from step environment", key);
            continue;
        }
        env.insert(key.clone(), value.clone());
    }
    env.into_iter().collect()
}
