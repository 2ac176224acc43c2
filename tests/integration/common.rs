use std::collections::HashMap;
use std::rc::Rc;

use pumaduct::backend::Backend;
use pumaduct::config::Config;
use pumaduct::db::Db;
use pumaduct::im_client::mock::MockImClient;
use pumaduct::im_client::ImClient;
use pumaduct::mainloop::MainLoop;
use pumaduct::matrix_client::fake::FakeMatrixClient;
use pumaduct::matrix_client::MatrixClient;

pub const TEST_CONFIG: &str = r#"
hs_server: "https://example.org"
hs_host: "example.org"
hs_access_token: "tok"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hstok"
networks:
  jabber:
    client: purple
    enabled: true
    prefix: jabber
    ext_pattern: "^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$"
    ext_format: "{user}@{host}"
"#;

/// Builds a `Backend` wired against an in-memory database, a fake Matrix
/// client, and a mock IM back-end.
pub fn test_backend() -> (Backend, Rc<MockImClient>) {
    let (backend, client, _db) = test_backend_with_db();
    (backend, client)
}

/// Same as `test_backend`, but also hands back the shared database so a test
/// can seed or inspect rows the layers would otherwise only touch internally.
pub fn test_backend_with_db() -> (Backend, Rc<MockImClient>, Rc<Db>) {
    let config = Config::from_yaml(TEST_CONFIG).unwrap();
    let main_loop = MainLoop::new();
    let handle = main_loop.handle();

    let db = Rc::new(Db::new(":memory:").unwrap());
    let matrix: Rc<dyn MatrixClient> = Rc::new(FakeMatrixClient::default());
    let mock_client = Rc::new(MockImClient::default());
    let mut clients: HashMap<String, Rc<dyn ImClient>> = HashMap::new();
    clients.insert("purple".to_string(), mock_client.clone() as Rc<dyn ImClient>);

    let mut backend = Backend::new(&config, matrix, clients, db.clone(), handle);
    backend.start();
    (backend, mock_client, db)
}
