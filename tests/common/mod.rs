//! A tiny in-memory `users` table behind a `RecordingDriver`, understanding
//! exactly the MySQL statements rendered for `User`.

#![allow(dead_code)]

use rustdac::driver::{self, Operation, RecordingDriver, Request, Response};
use rustdac::endpoint::{Runtime, Service};
use rustdac::rows::ColumnType;
use rustdac::{Client, Config, Dac, DacError, Entity, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Entity, Default, Debug, Clone, PartialEq)]
#[entity(table = "users")]
pub struct User {
    #[column("id,pk")]
    pub id: String,
    #[column("name")]
    pub name: String,
    #[column("v,aol")]
    pub v: i64,
}

#[derive(Default)]
pub struct Store {
    rows: Mutex<BTreeMap<String, (String, i64)>>,
}

impl Store {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<(String, i64)> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    fn handle(&self, request: &Request) -> rustdac::Result<Response> {
        let args: Vec<Value> = request.args.iter().map(|a| a.value().clone()).collect();
        let text = |idx: usize| args.get(idx).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let int = |idx: usize| args.get(idx).and_then(Value::as_i64).unwrap_or_default();
        let sql = request.sql.as_str();
        let mut rows = self.rows.lock().unwrap();

        match request.operation {
            Operation::Execute if sql.starts_with("INSERT") => {
                if let Some(row) = rows.get_mut(&text(0)) {
                    if sql.contains("ON DUPLICATE KEY UPDATE") {
                        // SET name = VALUES(name), v = v + 1
                        *row = (text(1), row.1 + 1);
                        return Ok(Response::affected(2));
                    }
                    if sql.starts_with("INSERT IGNORE") {
                        return Ok(Response::affected(0));
                    }
                    return Err(DacError::database("execute", "duplicate key"));
                }
                rows.insert(text(0), (text(1), int(2)));
                Ok(Response::affected(1))
            }
            Operation::Execute if sql.starts_with("UPDATE") => {
                // SET name = ?, v = v + 1 WHERE id = ? AND v = ?
                match rows.get_mut(&text(1)) {
                    Some(row) if row.1 == int(2) => {
                        *row = (text(0), row.1 + 1);
                        Ok(Response::affected(1))
                    }
                    _ => Ok(Response::affected(0)),
                }
            }
            Operation::Execute if sql.starts_with("DELETE") => {
                Ok(Response::affected(rows.remove(&text(0)).map_or(0, |_| 1)))
            }
            Operation::Query if sql.contains("COUNT(1)") => Ok(Response::rows(
                vec![ColumnType::new("_count", "BIGINT", false)],
                vec![vec![Value::Int(rows.len() as i64)]],
            )),
            Operation::Query if sql.starts_with("SELECT") => {
                let selected = rows
                    .iter()
                    .filter(|(id, _)| args.is_empty() || **id == text(0))
                    .map(|(id, (name, v))| vec![Value::String(id.clone()), Value::String(name.clone()), Value::Int(*v)])
                    .collect();
                Ok(Response::rows(
                    vec![
                        ColumnType::new("id", "VARCHAR", false),
                        ColumnType::new("name", "VARCHAR", false),
                        ColumnType::new("v", "BIGINT", false),
                    ],
                    selected,
                ))
            }
            _ => Ok(Response::Done),
        }
    }
}

pub struct Fixture {
    pub driver: Arc<RecordingDriver>,
    pub store: Arc<Store>,
    pub service: Arc<Service>,
    pub runtime: Arc<Runtime>,
}

impl Fixture {
    /// Registers a fresh driver under `name` and serves it through a
    /// private runtime.
    pub fn new(name: &str, max_age: Duration) -> Self {
        let store = Arc::new(Store::default());
        let backing = store.clone();
        let driver = Arc::new(RecordingDriver::with_handler(name, move |request| backing.handle(request)));
        driver::register(driver.clone()).unwrap();

        let config = Config::new("mysql", name, &format!("mem://{}", name))
            .transaction_max_age(max_age)
            .acquire_timeout(Duration::from_millis(200));
        let service = Arc::new(Service::new(&config).unwrap());
        let runtime = Arc::new(Runtime::new());
        runtime.register(service.clone()).unwrap();
        Self {
            driver,
            store,
            service,
            runtime,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(self.runtime.clone())
    }

    pub fn dac(&self) -> Dac {
        Dac::new(self.client())
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.driver.count(operation)
    }
}
