use futures_util::future::join_all;

use sb_domain::config::Config;
use sb_mcp_client::Connector;

use crate::backend::connect_backend;

/// Connect to every backend once, print the tools it would contribute and
/// close it again.
///
/// Returns `Ok(true)` when every backend connected.
pub async fn run(config: &Config, connector: &dyn Connector) -> anyhow::Result<bool> {
    println!("switchboard check");
    println!("=================\n");

    if config.backends.is_empty() {
        println!("  no backends configured");
        return Ok(false);
    }

    let results = join_all(config.backends.iter().map(|b| connect_backend(connector, b))).await;

    let mut all_passed = true;
    for (backend, result) in config.backends.iter().zip(results) {
        match result {
            Ok(connected) => {
                print_check(
                    &backend.name,
                    true,
                    format!("{} tool(s) via {}", connected.capabilities.len(), backend.endpoint()),
                );
                for cap in &connected.capabilities {
                    println!("      {}", cap.qualified_name);
                }
                connected.session.close().await;
            }
            Err(e) => {
                print_check(&backend.name, false, e.to_string());
                all_passed = false;
            }
        }
    }

    println!();
    if all_passed {
        println!("All backends reachable.");
    } else {
        println!("Some backends failed. Review the output above.");
    }

    Ok(all_passed)
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, FakeConnector};

    #[tokio::test]
    async fn reports_failures_and_closes_sessions() {
        let connector = FakeConnector::new()
            .with_backend("alpha", &["search"])
            .failing_connect("beta");
        let config = Config {
            backends: vec![descriptor("alpha"), descriptor("beta")],
            ..Config::default()
        };

        assert!(!run(&config, &connector).await.unwrap());
        assert!(connector.opened().iter().all(|b| b.is_closed()));
    }

    #[tokio::test]
    async fn all_reachable_passes() {
        let connector = FakeConnector::new().with_backend("alpha", &["search"]);
        let config = Config {
            backends: vec![descriptor("alpha")],
            ..Config::default()
        };
        assert!(run(&config, &connector).await.unwrap());
    }
}
