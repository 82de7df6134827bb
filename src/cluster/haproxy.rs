//! Load balancer configuration rendering
//!
//! The load balancer runs haproxy. Its configuration is rendered from a
//! Jinja template with [`minijinja`]. Templates see `frontend_port`,
//! `backend_port`, `ipv6` and a `servers` list whose items carry `name`,
//! `address`, `weight` and `endpoint`.

use std::collections::BTreeMap;

use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::Serialize;
use thiserror::Error;

/// Path of the configuration file inside the load balancer container
pub const CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

const TEMPLATE_NAME: &str = "haproxy.cfg";

/// Built-in configuration template
pub const DEFAULT_TEMPLATE: &str = r#"# generated by capd
global
  log /dev/log local0
  log /dev/log local1 notice
  daemon
  # limit memory usage to approximately 18 MB
  maxconn 100000

resolvers docker
  nameserver dns 127.0.0.11:53

defaults
  log global
  mode tcp
  option dontlognull
  timeout connect 5000
  timeout client 50000
  timeout server 50000
  # allow to boot despite dns don't resolve backends
  default-server init-addr none

frontend control-plane
  bind *:{{ frontend_port }}
  {%- if ipv6 %}
  bind :::{{ frontend_port }}
  {%- endif %}
  default_backend kube-apiservers

backend kube-apiservers
  option httpchk GET /healthz
  {%- for server in servers %}
  server {{ server.name }} {{ server.endpoint }} weight {{ server.weight }} check check-ssl verify none resolvers docker resolve-prefer {% if ipv6 %}ipv6{% else %}ipv4{% endif %}
  {%- endfor %}
"#;

/// Errors while parsing or rendering a template
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("invalid template: {0}")]
    Syntax(#[source] minijinja::Error),

    #[error("failed to render template: {0}")]
    Render(#[source] minijinja::Error),
}

/// One control-plane node as seen by the load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServer {
    pub address: String,
    pub weight: u32,
}

/// Values available to a configuration template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    pub frontend_port: u16,
    pub backend_port: u16,
    /// Keyed by node name, iteration order is the render order
    pub backend_servers: BTreeMap<String, BackendServer>,
    pub ipv6: bool,
}

impl ConfigData {
    /// Template context: root variables plus one object per server
    pub fn to_context(&self) -> Value {
        let servers: Vec<Value> = self
            .backend_servers
            .iter()
            .map(|(name, server)| {
                context! {
                    name => name,
                    address => &server.address,
                    weight => server.weight,
                    endpoint => endpoint(&server.address, self.backend_port),
                }
            })
            .collect();

        context! {
            frontend_port => self.frontend_port,
            backend_port => self.backend_port,
            ipv6 => self.ipv6,
            servers => servers,
        }
    }
}

/// host:port, with IPv6 hosts bracketed
pub fn endpoint(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Render a template against a context
///
/// Undefined variables are errors, and a trailing newline in the template is
/// kept so the written file ends the way the template does.
pub fn render<S: Serialize>(template: &str, ctx: S) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.add_template(TEMPLATE_NAME, template)
        .map_err(TemplateError::Syntax)?;

    env.get_template(TEMPLATE_NAME)
        .map_err(TemplateError::Syntax)?
        .render(ctx)
        .map_err(TemplateError::Render)
}

/// Render the load balancer configuration
pub fn config(data: &ConfigData, template: &str) -> Result<String, TemplateError> {
    render(template, data.to_context())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(ipv6: bool) -> ConfigData {
        let mut backend_servers = BTreeMap::new();
        backend_servers.insert(
            "demo-control-plane-b".to_string(),
            BackendServer {
                address: if ipv6 { "fc00::3" } else { "172.18.0.3" }.to_string(),
                weight: 100,
            },
        );
        backend_servers.insert(
            "demo-control-plane-a".to_string(),
            BackendServer {
                address: if ipv6 { "fc00::2" } else { "172.18.0.2" }.to_string(),
                weight: 50,
            },
        );
        ConfigData {
            frontend_port: 7443,
            backend_port: 6443,
            backend_servers,
            ipv6,
        }
    }

    #[test]
    fn test_substitution() {
        let out = render("port {{ port }}!", context! { port => 80 }).unwrap();
        assert_eq!(out, "port 80!");
    }

    #[test]
    fn test_if_else() {
        let tpl = "{% if on %}yes{% else %}no{% endif %}";
        assert_eq!(render(tpl, context! { on => true }).unwrap(), "yes");
        assert_eq!(render(tpl, context! { on => false }).unwrap(), "no");
    }

    #[test]
    fn test_loop_sees_outer_variables() {
        let tpl = "{% for item in items %}{{ item.name }}={{ tag }};{% endfor %}";
        let items = vec![context! { name => "a" }, context! { name => "b" }];
        let ctx = context! { tag => "outer", items => items };
        assert_eq!(render(tpl, ctx).unwrap(), "a=outer;b=outer;");
    }

    #[test]
    fn test_whitespace_trimming() {
        let tpl = "a\n  {{- x -}}\n  b";
        assert_eq!(render(tpl, context! { x => "X" }).unwrap(), "aXb");
    }

    #[test]
    fn test_keeps_trailing_newline() {
        assert_eq!(render("{{ x }}\n", context! { x => 1 }).unwrap(), "1\n");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            render("{{ missing }}", context! {}),
            Err(TemplateError::Render(_))
        ));
        assert!(matches!(
            render("{% if x %}open", context! { x => true }),
            Err(TemplateError::Syntax(_))
        ));
        assert!(matches!(
            render("{% endfor %}", context! {}),
            Err(TemplateError::Syntax(_))
        ));
        assert!(matches!(
            render("{% for i in x %}{% endfor %}", context! { x => 1 }),
            Err(TemplateError::Render(_))
        ));
        assert!(matches!(
            render("{{ open", context! {}),
            Err(TemplateError::Syntax(_))
        ));
    }

    #[test]
    fn test_endpoint_brackets_ipv6() {
        assert_eq!(endpoint("172.18.0.2", 6443), "172.18.0.2:6443");
        assert_eq!(endpoint("fc00::2", 6443), "[fc00::2]:6443");
    }

    #[test]
    fn test_default_template_ipv4() {
        let out = config(&data(false), DEFAULT_TEMPLATE).unwrap();

        assert!(out.contains("  bind *:7443\n  default_backend kube-apiservers"));
        assert!(!out.contains("bind :::"));

        let servers: Vec<&str> = out
            .lines()
            .filter(|l| l.trim_start().starts_with("server "))
            .collect();
        assert_eq!(
            servers,
            vec![
                "  server demo-control-plane-a 172.18.0.2:6443 weight 50 check check-ssl verify none resolvers docker resolve-prefer ipv4",
                "  server demo-control-plane-b 172.18.0.3:6443 weight 100 check check-ssl verify none resolvers docker resolve-prefer ipv4",
            ]
        );
        assert!(out.contains("option httpchk GET /healthz\n  server demo-control-plane-a"));
    }

    #[test]
    fn test_default_template_ipv6() {
        let out = config(&data(true), DEFAULT_TEMPLATE).unwrap();
        assert!(out.contains("  bind *:7443\n  bind :::7443\n  default_backend"));
        assert!(out.contains("server demo-control-plane-a [fc00::2]:6443 weight 50"));
        assert!(out.contains("resolve-prefer ipv6"));
    }

    #[test]
    fn test_default_template_without_servers() {
        let mut empty = data(false);
        empty.backend_servers.clear();
        let out = config(&empty, DEFAULT_TEMPLATE).unwrap();
        assert!(out.ends_with("  option httpchk GET /healthz\n"));
    }
}
