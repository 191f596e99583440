// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use log::info;
use surrealdb::engine::local::{Db, Mem};
use surrealdb::engine::remote::http::{Client, Http, Https};
use surrealdb::Surreal;

pub enum SurrealConnection {
    Local(Surreal<Db>),
    RemoteHttp(Surreal<Client>),
}

impl SurrealConnection {
    pub async fn use_ns(&self, namespace: &str) -> Result<(), surrealdb::Error> {
        match self {
            Self::Local(db) => db.use_ns(namespace).await,
            Self::RemoteHttp(db) => db.use_ns(namespace).await,
        }
    }

    pub async fn use_db(&self, database: &str) -> Result<(), surrealdb::Error> {
        match self {
            Self::Local(db) => db.use_db(database).await,
            Self::RemoteHttp(db) => db.use_db(database).await,
        }
    }

    pub async fn query(&self, sql: &str) -> Result<surrealdb::Response, surrealdb::Error> {
        match self {
            Self::Local(db) => db.query(sql).await,
            Self::RemoteHttp(db) => db.query(sql).await,
        }
    }

    pub async fn query_with_binds(
        &self,
        sql: &str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> Result<surrealdb::Response, surrealdb::Error> {
        match self {
            Self::Local(db) => {
                let mut call = db.query(sql);
                for (k, v) in binds.into_iter() {
                    call = call.bind((k, v));
                }
                call.await
            }
            Self::RemoteHttp(db) => {
                let mut call = db.query(sql);
                for (k, v) in binds.into_iter() {
                    call = call.bind((k, v));
                }
                call.await
            }
        }
    }
}

/// Turn a configured DB host into the `host:port` target the Surreal HTTP
/// client expects, and whether TLS is wanted.
///
/// Accepts `host`, `host:port`, `http(s)://host:port`, `ws(s)://host:port`,
/// with or without a trailing `/rpc`.
pub fn normalize_http_target(host: &str) -> (bool, String) {
    let trimmed = host.trim();
    let (tls, rest) = if let Some(r) = trimmed.strip_prefix("https://") {
        (true, r)
    } else if let Some(r) = trimmed.strip_prefix("wss://") {
        (true, r)
    } else if let Some(r) = trimmed.strip_prefix("http://") {
        (false, r)
    } else if let Some(r) = trimmed.strip_prefix("ws://") {
        (false, r)
    } else {
        (false, trimmed)
    };
    let mut target = rest.trim_end_matches('/').to_string();
    if let Some(stripped) = target.strip_suffix("/rpc") {
        target = stripped.to_string();
    }
    let target = target.trim_start_matches('/').to_string();
    (tls, target)
}

/// Establish a SurrealDB connection.
///
/// With a `url` the remote HTTP client is used, signing in as root when both
/// credentials are present. Without one an embedded in-memory engine is
/// started; its data lives only as long as the process.
pub async fn connect(
    url: Option<&str>,
    user: Option<&str>,
    pass: Option<&str>,
    ns: &str,
    db: &str,
) -> anyhow::Result<SurrealConnection> {
    let conn = match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => {
            let (tls, target) = normalize_http_target(url);
            info!(
                "connecting to SurrealDB at {}://{} ns={} db={}",
                if tls { "https" } else { "http" },
                target,
                ns,
                db
            );
            let client = if tls {
                Surreal::new::<Https>(target.as_str()).await?
            } else {
                Surreal::new::<Http>(target.as_str()).await?
            };
            if let (Some(u), Some(p)) = (user, pass) {
                client
                    .signin(surrealdb::opt::auth::Root {
                        username: u,
                        password: p,
                    })
                    .await?;
            }
            SurrealConnection::RemoteHttp(client)
        }
        None => {
            info!("No DB_HOST provided, using embedded Mem ns={} db={}", ns, db);
            SurrealConnection::Local(Surreal::new::<Mem>(()).await?)
        }
    };
    conn.use_ns(ns).await?;
    conn.use_db(db).await?;
    Ok(conn)
}
