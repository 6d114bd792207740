//! Coordination-store key layout.
//!
//! Instances live at `/<prefix>/<name>/<addr>`. Prefixes are normalized so
//! that `"svc"`, `"/svc"` and `"/svc/"` all address the same namespace.

/// Strips leading and trailing slashes from a registry prefix.
#[must_use]
pub fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

/// Key prefix covering every instance of `name`, with a trailing slash.
#[must_use]
pub fn service_prefix(prefix: &str, name: &str) -> String {
    let prefix = normalize_prefix(prefix);
    if prefix.is_empty() {
        format!("/{name}/")
    } else {
        format!("/{prefix}/{name}/")
    }
}

/// Key of a single instance.
#[must_use]
pub fn instance_key(prefix: &str, name: &str, addr: &str) -> String {
    let mut key = service_prefix(prefix, name);
    key.push_str(addr);
    key
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn prefix_variants_agree() {
        assert_eq!(service_prefix("svc", "greeter"), "/svc/greeter/");
        assert_eq!(service_prefix("/svc", "greeter"), "/svc/greeter/");
        assert_eq!(service_prefix("/svc/", "greeter"), "/svc/greeter/");
        assert_eq!(service_prefix("", "greeter"), "/greeter/");
    }

    #[test]
    fn instance_key_layout() {
        assert_eq!(
            instance_key("microservices", "greeter", "10.0.0.1:9000"),
            "/microservices/greeter/10.0.0.1:9000"
        );
    }

    proptest! {
        #[test]
        fn instance_key_is_under_service_prefix(
            prefix in "[a-z]{0,8}",
            name in "[a-z][a-z0-9-]{0,12}",
            addr in "[0-9.]{1,15}:[0-9]{1,5}",
        ) {
            let key = instance_key(&prefix, &name, &addr);
            let service = service_prefix(&prefix, &name);
            prop_assert!(key.starts_with(&service));
            prop_assert_eq!(&key[service.len()..], addr.as_str());
        }
    }
}
