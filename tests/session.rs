use httpmock::Method::GET;
use httpmock::MockServer;
use serde_json::json;
use serial_test::serial;
use url::Url;

mod common;

use stampede::prelude::*;

const PROFILE_PATH: &str = "/api/v1/user/profile";
const INDEX_PATH: &str = "/";

fn index_catalog() -> Catalog {
    Catalog::new("Example").register_task(TaskDescriptor::get(INDEX_PATH))
}

#[tokio::test]
// A task invoked on a user with no initialized session fails without any
// request going out.
async fn test_task_without_session_makes_no_request() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let configuration = common::build_configuration(&server, vec![]);
    let base_url = Url::parse(&server.base_url()).unwrap();
    let user = AttackUser::new(
        0,
        base_url,
        None,
        common::TEST_TOKEN.to_string(),
        &configuration,
    )
    .unwrap();

    match user.execute(&TaskDescriptor::get(INDEX_PATH)).await {
        Err(TaskError::MissingSession) => (),
        _ => panic!("expected MissingSession error"),
    }

    // No request reached the server.
    assert_eq!(index.hits(), 0);
}

#[tokio::test]
// Once the session is initialized, its derived headers ride along on every
// request the user makes.
async fn test_initialized_session_headers_are_sent() {
    let server = MockServer::start();

    // The mock only matches requests carrying the derived bearer header.
    let index = server.mock(|when, then| {
        when.method(GET)
            .path(INDEX_PATH)
            .header("Authorization", "Bearer abc123");
        then.status(200);
    });

    let configuration = common::build_configuration(&server, vec![]);
    let base_url = Url::parse(&server.base_url()).unwrap();
    let mut user = AttackUser::new(
        0,
        base_url,
        None,
        common::TEST_TOKEN.to_string(),
        &configuration,
    )
    .unwrap();

    user.initialize_session().unwrap();
    // The derived header mapping is Authorization: Bearer <token>.
    let session = user.session().unwrap();
    assert_eq!(
        session
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .unwrap(),
        "Bearer abc123"
    );

    let response = user
        .execute(&TaskDescriptor::get(INDEX_PATH))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(index.hits(), 1);
}

#[test]
#[serial]
// With --verify-path configured, each user issues one authenticated
// verification request when its session is derived.
fn test_session_verification() {
    let server = MockServer::start();

    let profile = server.mock(|when, then| {
        when.method(GET)
            .path(PROFILE_PATH)
            .header("Authorization", "Bearer abc123");
        then.status(200)
            .json_body(json!({"email": "load@example.com"}));
    });
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let mut configuration_flags = common::provision_token("STAMPEDE_TEST_VERIFY_TOKEN");
    configuration_flags.extend_from_slice(&["--verify-path", PROFILE_PATH]);
    let configuration = common::build_configuration(&server, configuration_flags);

    let metrics = Stampede::initialize_with_config(configuration)
        .unwrap()
        .register_catalog(index_catalog())
        .execute()
        .unwrap();

    // The single user verified its session exactly once, then generated load.
    assert_eq!(profile.hits(), 1);
    assert!(index.hits() > 0);

    // The verification request is recorded like any other.
    let profile_metrics = metrics
        .requests
        .get(&format!("GET {}", PROFILE_PATH))
        .unwrap();
    assert_eq!(profile_metrics.success_count, 1);
}

#[test]
#[serial]
// A failed verification is recorded in the metrics, and the user proceeds
// into the task loop anyway.
fn test_failed_verification_proceeds() {
    let server = MockServer::start();

    let profile = server.mock(|when, then| {
        when.method(GET).path(PROFILE_PATH);
        then.status(401);
    });
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let mut configuration_flags = common::provision_token("STAMPEDE_TEST_BAD_VERIFY_TOKEN");
    configuration_flags.extend_from_slice(&["--verify-path", PROFILE_PATH]);
    let configuration = common::build_configuration(&server, configuration_flags);

    let metrics = Stampede::initialize_with_config(configuration)
        .unwrap()
        .register_catalog(index_catalog())
        .execute()
        .unwrap();

    // The verification failed but the user still generated load.
    assert_eq!(profile.hits(), 1);
    assert!(index.hits() > 0);

    let profile_metrics = metrics
        .requests
        .get(&format!("GET {}", PROFILE_PATH))
        .unwrap();
    assert_eq!(profile_metrics.fail_count, 1);
}
