use gumdrop::Options;
use httpmock::MockServer;

use stampede::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to
/// avoid compiler warnings during testing.

/// The token tests provision in their environment variable.
#[allow(dead_code)]
pub const TEST_TOKEN: &str = "abc123";

/// The following options are configured by default, if not set to a custom
/// value:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 1
///  --run-time 1
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> Configuration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using the mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Default to testing with 1 user if not otherwise configured.
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "1"]);
    }

    // Default to hatching 1 user per second if not otherwise configured.
    if !configuration.contains(&"--hatch-rate") {
        configuration.extend_from_slice(&["--hatch-rate", "1"]);
    }

    // Default to running for 1 second if not otherwise configured.
    if !configuration.contains(&"--run-time") {
        configuration.extend_from_slice(&["--run-time", "1"]);
    }

    // Parse these options to generate a Configuration.
    Configuration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Provision a bearer token in the named environment variable and return the
/// options pointing the load test at it.
#[allow(dead_code)]
pub fn provision_token(variable: &'static str) -> Vec<&'static str> {
    std::env::set_var(variable, TEST_TOKEN);
    vec!["--token-env", variable]
}
