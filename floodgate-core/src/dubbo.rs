//! Dubbo2 request descriptor.
//!
//! Dubbo2 listeners hand the gateway the decoded invocation fields; the
//! router matches on `interface/method` exactly like a gRPC path.

use crate::router::ALL;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dubbo2Service {
    path: String,
    interface: String,
    group: String,
    version: String,
    method: String,
}

impl Dubbo2Service {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            group: group.into(),
            version: version.into(),
            method: method.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn set_interface(&mut self, interface: impl Into<String>) {
        self.interface = interface.into();
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.group = group.into();
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.method = method.into();
    }

    /// Router path of the invocation, `/interface/method`.
    pub fn route_path(&self) -> String {
        let method = if self.method.is_empty() {
            ALL
        } else {
            self.method.as_str()
        };
        format!("/{}/{}", self.interface, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_path_defaults_method_to_wildcard() {
        let mut svc = Dubbo2Service::new("/demo", "com.demo.Echo", "g", "1.0", "");
        assert_eq!(svc.route_path(), "/com.demo.Echo/*");
        svc.set_method("say");
        assert_eq!(svc.route_path(), "/com.demo.Echo/say");
    }
}
