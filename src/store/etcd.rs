//! etcd-backed store. TTLs map onto etcd leases; conditional writes onto
//! single-compare transactions.

use super::{KvStore, Precondition};
use crate::common::Result;
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use std::time::Duration;

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        tracing::info!(?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    fn compare(key: &str, cond: Precondition) -> Option<Compare> {
        match cond {
            Precondition::None => None,
            Precondition::MustNotExist => Some(Compare::version(key, CompareOp::Equal, 0)),
            Precondition::ValueEquals(v) => Some(Compare::value(key, CompareOp::Equal, v)),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        cond: Precondition,
    ) -> Result<bool> {
        let mut client = self.client.clone();

        let lease_id = match ttl {
            Some(ttl) => {
                let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
                Some(client.lease_grant(secs, None).await?.id())
            }
            None => None,
        };
        let opts = lease_id.map(|id| PutOptions::new().with_lease(id));

        let Some(cmp) = Self::compare(key, cond) else {
            if let Err(e) = client.put(key, value, opts).await {
                if let Some(id) = lease_id {
                    let _ = client.lease_revoke(id).await;
                }
                return Err(e.into());
            }
            return Ok(true);
        };

        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, opts)]);

        let succeeded = match client.txn(txn).await {
            Ok(resp) => resp.succeeded(),
            Err(e) => {
                if let Some(id) = lease_id {
                    let _ = client.lease_revoke(id).await;
                }
                return Err(e.into());
            }
        };

        if !succeeded {
            if let Some(id) = lease_id {
                let _ = client.lease_revoke(id).await;
            }
        }

        Ok(succeeded)
    }

    async fn delete(&self, key: &str, cond: Precondition) -> Result<bool> {
        let mut client = self.client.clone();

        let Some(cmp) = Self::compare(key, cond) else {
            let resp = client.delete(key, None).await?;
            return Ok(resp.deleted() > 0);
        };

        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::delete(key, None)]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            entries.push((kv.key_str()?.to_string(), kv.value().to_vec()));
        }
        Ok(entries)
    }
}
