//! Allow-list and deny-list checks for container engine invocations.
//!
//! Everything here is pure: it only looks at argument vectors.

use crate::errors::ShipError;

/// Engine subcommands the gateway may invoke
pub const ENGINE_SUBCOMMANDS: [&str; 17] = [
    "build", "buildx", "image", "inspect", "pull", "push", "tag", "run", "start", "stop", "rm",
    "restart", "ps", "logs", "login", "logout", "system",
];

/// Operations that never auto-escalate on permission errors
const HIGH_IMPACT: [&str; 3] = ["run", "build", "login"];

/// `run` flags that share a host namespace when set to `host`
const HOST_NAMESPACE_FLAGS: [&str; 7] = [
    "--pid", "--network", "--net", "--ipc", "--uts", "--userns", "--cgroupns",
];

/// `run` flags rejected whatever their value
const FORBIDDEN_RUN_FLAGS: [&str; 6] = [
    "--privileged",
    "--cap-add",
    "--device",
    "--security-opt",
    "--volumes-from",
    "--device-cgroup-rule",
];

/// `run` flags that take no value
const BOOLEAN_RUN_FLAGS: [&str; 18] = [
    "-d",
    "--detach",
    "-i",
    "--interactive",
    "-t",
    "--tty",
    "-P",
    "--publish-all",
    "-q",
    "--quiet",
    "--rm",
    "--init",
    "--read-only",
    "--no-healthcheck",
    "--oom-kill-disable",
    "--sig-proxy",
    "--disable-content-trust",
    "--privileged",
];

/// Short boolean `run` flags that may be clustered, as in `-dit`
const BOOLEAN_SHORT_FLAGS: &str = "ditPq";

/// Compose flags allowed before the subcommand; all take a value
const COMPOSE_GLOBAL_FLAGS: [&str; 6] = [
    "-f",
    "--file",
    "-p",
    "--project-name",
    "--project-directory",
    "--env-file",
];

const COMPOSE_UP_FLAGS: [&str; 6] = [
    "-d",
    "--detach",
    "--build",
    "--remove-orphans",
    "--force-recreate",
    "--no-color",
];

const COMPOSE_DOWN_FLAGS: [&str; 1] = ["--remove-orphans"];

fn denied(message: String) -> ShipError {
    ShipError::ValidationError(message)
}

/// Validate a full engine argument vector (without the binary name)
pub fn validate_engine_args(args: &[String]) -> Result<(), ShipError> {
    let Some(subcommand) = args.first() else {
        return Err(denied("Empty container engine invocation".to_string()));
    };
    let rest = &args[1..];

    match subcommand.as_str() {
        "compose" => validate_compose_args(rest),
        "system" => match rest.first().map(String::as_str) {
            Some("df") => Ok(()),
            _ => Err(denied("Only `system df` is allowed".to_string())),
        },
        "image" => match rest.first().map(String::as_str) {
            Some("inspect") | Some("ls") => Ok(()),
            other => Err(denied(format!(
                "Image subcommand {:?} is not allowed",
                other.unwrap_or("")
            ))),
        },
        "buildx" => match rest.first().map(String::as_str) {
            Some("build") => Ok(()),
            _ => Err(denied("Only `buildx build` is allowed".to_string())),
        },
        "run" => validate_run_flags(rest),
        other if ENGINE_SUBCOMMANDS.contains(&other) => Ok(()),
        other => Err(denied(format!(
            "Container engine subcommand '{}' is not allowed",
            other
        ))),
    }
}

/// Split `--flag=value` into `(--flag, Some(value))`
fn split_flag(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with('-') => (flag, Some(value)),
        _ => (arg, None),
    }
}

/// Split one `run` option: `--flag=value`, attached short values such as
/// `-v/src:/dst` or `-p80:80`, or a bare flag
fn split_run_option(arg: &str) -> (&str, Option<&str>) {
    if arg.starts_with("--") {
        return split_flag(arg);
    }
    match (arg.get(..2), arg.get(2..)) {
        (Some(flag), Some(rest)) if !rest.is_empty() && !is_short_cluster(arg) => {
            (flag, Some(rest.strip_prefix('=').unwrap_or(rest)))
        }
        _ => (arg, None),
    }
}

fn is_short_cluster(arg: &str) -> bool {
    arg.len() > 2 && arg[1..].chars().all(|c| BOOLEAN_SHORT_FLAGS.contains(c))
}

/// Reject privilege-escalating `run` flags. Scanning stops at the image
/// name: what follows is the container's own command line.
pub fn validate_run_flags(args: &[String]) -> Result<(), ShipError> {
    let mut iter = args.iter().map(String::as_str);
    while let Some(arg) = iter.next() {
        if arg == "--" || !arg.starts_with('-') || arg == "-" {
            break;
        }
        let (flag, inline) = split_run_option(arg);

        if FORBIDDEN_RUN_FLAGS.contains(&flag) {
            return Err(denied(format!("Flag '{}' is not allowed for run", flag)));
        }
        if BOOLEAN_RUN_FLAGS.contains(&flag) || is_short_cluster(flag) {
            continue;
        }

        let value = inline.or_else(|| iter.next()).unwrap_or("");

        if HOST_NAMESPACE_FLAGS.contains(&flag) && value.eq_ignore_ascii_case("host") {
            return Err(denied(format!("Host namespace sharing ({}=host) is not allowed", flag)));
        }

        if (flag == "-v" || flag == "--volume") && is_bind_source(value.split(':').next().unwrap_or("")) {
            return Err(denied(format!("Bind mount '{}' is not allowed", value)));
        }

        if flag == "--mount" && value.split(',').any(|part| part.trim() == "type=bind") {
            return Err(denied(format!("Bind mount '{}' is not allowed", value)));
        }
    }
    Ok(())
}

/// Named volumes are fine; host paths are bind mounts
fn is_bind_source(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// Validate compose arguments: global file/project flags, then `up` or `down`
/// with their few allowed flags
pub fn validate_compose_args(args: &[String]) -> Result<(), ShipError> {
    let mut iter = args.iter().map(String::as_str);

    let subcommand = loop {
        let Some(arg) = iter.next() else {
            return Err(denied("Compose invocation without subcommand".to_string()));
        };
        let (flag, inline) = split_flag(arg);
        if COMPOSE_GLOBAL_FLAGS.contains(&flag) {
            if inline.is_none() && iter.next().is_none() {
                return Err(denied(format!("Compose flag '{}' requires a value", flag)));
            }
            continue;
        }
        break arg;
    };

    let allowed: &[&str] = match subcommand {
        "up" => &COMPOSE_UP_FLAGS,
        "down" => &COMPOSE_DOWN_FLAGS,
        other => {
            return Err(denied(format!("Compose subcommand '{}' is not allowed", other)));
        }
    };

    for arg in iter {
        if !allowed.contains(&arg) {
            return Err(denied(format!(
                "Argument '{}' is not allowed for compose {}",
                arg, subcommand
            )));
        }
    }
    Ok(())
}

/// Whether a permission failure on these args must not be retried elevated
pub fn is_high_impact(args: &[String]) -> bool {
    match args.first().map(String::as_str) {
        Some("buildx") => true,
        Some(subcommand) => HIGH_IMPACT.contains(&subcommand),
        None => false,
    }
}

/// Whether engine stderr reports a daemon permission/access problem
pub fn is_permission_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("got permission denied while trying to connect")
        || (stderr.contains("permission denied")
            && (stderr.contains("docker.sock")
                || stderr.contains("daemon socket")
                || stderr.contains("podman.sock")))
}
