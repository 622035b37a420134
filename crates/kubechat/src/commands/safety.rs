//! Safety classification and the executable allow-list.

use kubechat_protocol::SafetyLevel;

use crate::error::HubError;

/// Destructive or irreversible operations.
const DANGEROUS_PATTERNS: &[&str] = &[
    "delete",
    "destroy",
    "rm",
    "--force",
    "--cascade=foreground",
    "drain",
    "cordon",
    "evict",
    "--grace-period=0",
];

/// Mutating but reversible operations.
const WARNING_PATTERNS: &[&str] = &[
    "create", "apply", "patch", "replace", "scale", "restart", "edit", "label", "annotate",
    "expose", "rollout",
];

/// Classify a literal command by case-insensitive substring match.
///
/// Dangerous patterns are checked first. An empty command is dangerous.
pub fn classify(command: &str) -> SafetyLevel {
    let lower = command.trim().to_lowercase();
    if lower.is_empty() {
        return SafetyLevel::Dangerous;
    }
    if DANGEROUS_PATTERNS.iter().any(|p| lower.contains(p)) {
        return SafetyLevel::Dangerous;
    }
    if WARNING_PATTERNS.iter().any(|p| lower.contains(p)) {
        return SafetyLevel::Warning;
    }
    SafetyLevel::Safe
}

/// Split a command into program and arguments, refusing anything but the
/// allowed executable.
pub fn check_allowed<'a>(command: &'a str, allowed_executable: &str) -> Result<Vec<&'a str>, HubError> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    match parts.first() {
        None => Err(HubError::EmptyCommand),
        Some(program) if *program == allowed_executable => Ok(parts),
        Some(_) => Err(HubError::UnsafeCommand(allowed_executable.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_commands_are_safe() {
        assert_eq!(classify("kubectl get pods"), SafetyLevel::Safe);
        assert_eq!(classify("kubectl describe deployment web"), SafetyLevel::Safe);
        assert_eq!(classify("kubectl logs api-0 -n prod"), SafetyLevel::Safe);
    }

    #[test]
    fn test_mutations_are_warnings() {
        assert_eq!(classify("kubectl apply -f app.yaml"), SafetyLevel::Warning);
        assert_eq!(classify("kubectl scale deploy/web --replicas=3"), SafetyLevel::Warning);
        assert_eq!(classify("kubectl rollout restart deploy/web"), SafetyLevel::Warning);
        assert_eq!(classify("KUBECTL LABEL pod x a=b"), SafetyLevel::Warning);
    }

    #[test]
    fn test_dangerous_wins_over_warning() {
        assert_eq!(classify("kubectl delete pod nginx --force"), SafetyLevel::Dangerous);
        // "create" is a warning pattern, "--force" is dangerous
        assert_eq!(classify("kubectl create -f x.yaml --force"), SafetyLevel::Dangerous);
        assert_eq!(classify("kubectl drain node-1"), SafetyLevel::Dangerous);
        assert_eq!(
            classify("kubectl delete pod x --grace-period=0"),
            SafetyLevel::Dangerous
        );
        assert_eq!(classify("kubectl DELETE ns staging"), SafetyLevel::Dangerous);
    }

    #[test]
    fn test_empty_fails_closed() {
        assert_eq!(classify(""), SafetyLevel::Dangerous);
        assert_eq!(classify("   "), SafetyLevel::Dangerous);
    }

    #[test]
    fn test_allow_list() {
        assert_eq!(
            check_allowed("kubectl get pods", "kubectl").unwrap(),
            vec!["kubectl", "get", "pods"]
        );
        assert_eq!(check_allowed("  ", "kubectl"), Err(HubError::EmptyCommand));
        assert_eq!(
            check_allowed("bash -c 'kubectl get pods'", "kubectl"),
            Err(HubError::UnsafeCommand("kubectl".to_string()))
        );
        // Prefix match is not enough
        assert!(check_allowed("kubectl-evil get pods", "kubectl").is_err());
    }
}
