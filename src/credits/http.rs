//! Credit ledger backed by an external billing service

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::CreditLedger;
use crate::error::LedgerError;

#[derive(Debug, Serialize)]
struct AmountRequest<'a> {
    owner_id: &'a str,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: i64,
}

/// Talks to `POST {base}/credits/{check,deduct,refund}` and `GET {base}/credits/{owner}`
pub struct HttpLedger {
    client: Client,
    base_url: url::Url,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = url::Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, LedgerError> {
        self.base_url
            .join(path)
            .map_err(|e| LedgerError::Unavailable(format!("bad ledger url: {}", e)))
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, owner: &str, amount: u64) -> Result<T, LedgerError> {
        let url = self.endpoint(path)?;
        debug!("Ledger POST {} owner={} amount={}", url, owner, amount);
        let resp = self
            .client
            .post(url)
            .json(&AmountRequest { owner_id: owner, amount })
            .send()
            .await?;
        match resp.status().as_u16() {
            404 => Err(LedgerError::UnknownOwner(owner.to_string())),
            402 => {
                let available = resp.json::<BalanceResponse>().await.map(|b| b.balance).unwrap_or(0);
                Err(LedgerError::Insufficient { needed: amount, available })
            }
            s if !(200..300).contains(&s) => Err(LedgerError::Unavailable(format!("ledger returned {}", s))),
            _ => Ok(resp.json::<T>().await?),
        }
    }
}

#[async_trait]
impl CreditLedger for HttpLedger {
    async fn check(&self, owner: &str, amount: u64) -> Result<bool, LedgerError> {
        let resp: CheckResponse = self.post("credits/check", owner, amount).await?;
        Ok(resp.ok)
    }

    async fn deduct(&self, owner: &str, amount: u64) -> Result<i64, LedgerError> {
        let resp: BalanceResponse = self.post("credits/deduct", owner, amount).await?;
        Ok(resp.balance)
    }

    async fn refund(&self, owner: &str, amount: u64) -> Result<i64, LedgerError> {
        let resp: BalanceResponse = self.post("credits/refund", owner, amount).await?;
        Ok(resp.balance)
    }

    async fn balance(&self, owner: &str) -> Result<i64, LedgerError> {
        let url = self.endpoint(&format!("credits/{}", owner))?;
        let resp = self.client.get(url).send().await?;
        if resp.status().as_u16() == 404 {
            return Err(LedgerError::UnknownOwner(owner.to_string()));
        }
        let resp = resp.error_for_status()?;
        Ok(resp.json::<BalanceResponse>().await?.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let ledger = HttpLedger::new("http://billing.local/api/").unwrap();
        assert_eq!(
            ledger.endpoint("credits/check").unwrap().as_str(),
            "http://billing.local/api/credits/check"
        );
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(HttpLedger::new("not a url").is_err());
    }
}
