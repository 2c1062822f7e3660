//! Client for the funding-rate aggregation service.
//!
//! The service pre-normalizes rates to a per-second basis and ranks
//! opportunities server-side; we re-filter and re-rank locally against our
//! own fee model. A static in-process source backs paper mode and tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::models::Opportunity;

/// `GET /api/v1/funding-rates/compare` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateComparison {
    /// Per-second, short minus long.
    pub divergence: f64,
    pub long_rate: f64,
    pub short_rate: f64,
}

/// Wire shape of one opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOpportunity {
    pub symbol: String,
    pub long_dex: String,
    pub short_dex: String,
    pub divergence: f64,
    pub long_rate: f64,
    pub short_rate: f64,
    #[serde(default)]
    pub long_oi_usd: f64,
    #[serde(default)]
    pub short_oi_usd: f64,
    pub net_profit_apy: f64,
    #[serde(default)]
    pub min_volume_24h_usd: f64,
}

#[derive(Debug, Deserialize)]
struct OpportunitiesResponse {
    opportunities: Vec<ServiceOpportunity>,
}

impl ServiceOpportunity {
    /// Convert to the core model. Non-finite numbers exclude the whole
    /// opportunity (warned, never traded).
    pub fn into_opportunity(self) -> Option<Opportunity> {
        let to_dec = |v: f64, field: &str| -> Option<Decimal> {
            match Decimal::from_f64(v) {
                Some(d) => Some(d),
                None => {
                    warn!(symbol = %self.symbol, field, value = v, "excluding opportunity with non-finite rate");
                    None
                }
            }
        };
        Some(Opportunity {
            long_rate: to_dec(self.long_rate, "long_rate")?,
            short_rate: to_dec(self.short_rate, "short_rate")?,
            divergence: to_dec(self.divergence, "divergence")?,
            net_apy: to_dec(self.net_profit_apy, "net_profit_apy")?,
            long_oi_usd: to_dec(self.long_oi_usd, "long_oi_usd")?,
            short_oi_usd: to_dec(self.short_oi_usd, "short_oi_usd")?,
            min_volume_24h_usd: to_dec(self.min_volume_24h_usd, "min_volume_24h_usd")?,
            symbol: self.symbol,
            long_venue: self.long_dex,
            short_venue: self.short_dex,
            observed_at: Utc::now(),
        })
    }
}

/// Query parameters for the opportunities endpoint.
#[derive(Debug, Clone, Default)]
pub struct OpportunityQuery {
    pub min_profit: Option<Decimal>,
    pub max_oi_usd: Option<Decimal>,
    pub dexes: Vec<String>,
    pub symbols: Vec<String>,
}

/// Abstract source so the orchestrator can run against the HTTP service or
/// a static in-process feed (paper mode, tests).
#[async_trait]
pub trait FundingSource: Send + Sync {
    async fn opportunities(&self, query: &OpportunityQuery) -> Result<Vec<Opportunity>>;

    async fn compare(&self, symbol: &str, dex1: &str, dex2: &str) -> Result<RateComparison>;

    async fn best(&self, symbol: &str) -> Result<Option<Opportunity>>;
}

pub struct FundingServiceClient {
    client: Client,
    base_url: String,
}

impl FundingServiceClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build funding service client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl FundingSource for FundingServiceClient {
    async fn opportunities(&self, query: &OpportunityQuery) -> Result<Vec<Opportunity>> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(4);
        if let Some(min_profit) = query.min_profit {
            qp.push(("min_profit".to_string(), min_profit.to_string()));
        }
        if let Some(max_oi) = query.max_oi_usd {
            qp.push(("max_oi_usd".to_string(), max_oi.to_string()));
        }
        if !query.dexes.is_empty() {
            qp.push(("dexes".to_string(), query.dexes.join(",")));
        }
        if !query.symbols.is_empty() {
            qp.push(("symbols".to_string(), query.symbols.join(",")));
        }

        let resp = self
            .client
            .get(self.url("/api/v1/opportunities"))
            .query(&qp)
            .send()
            .await
            .context("GET /api/v1/opportunities failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET /api/v1/opportunities {}: {}", status, text);
        }

        let body: OpportunitiesResponse = resp
            .json()
            .await
            .context("parse opportunities response")?;
        Ok(body
            .opportunities
            .into_iter()
            .filter_map(|o| o.into_opportunity())
            .collect())
    }

    async fn compare(&self, symbol: &str, dex1: &str, dex2: &str) -> Result<RateComparison> {
        let resp = self
            .client
            .get(self.url("/api/v1/funding-rates/compare"))
            .query(&[("symbol", symbol), ("dex1", dex1), ("dex2", dex2)])
            .send()
            .await
            .context("GET /api/v1/funding-rates/compare failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET /api/v1/funding-rates/compare {}: {}", status, text);
        }

        resp.json().await.context("parse compare response")
    }

    async fn best(&self, symbol: &str) -> Result<Option<Opportunity>> {
        let resp = self
            .client
            .get(self.url("/api/v1/opportunities/best"))
            .query(&[("symbol", symbol)])
            .send()
            .await
            .context("GET /api/v1/opportunities/best failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET /api/v1/opportunities/best {}: {}", status, text);
        }

        let body: ServiceOpportunity = resp.json().await.context("parse best response")?;
        Ok(body.into_opportunity())
    }
}

/// Fixed opportunity set served from memory. Paper mode runs on it; tests
/// mutate it between cycles to script rate moves.
#[derive(Default)]
pub struct StaticFundingSource {
    opportunities: RwLock<Vec<Opportunity>>,
}

impl StaticFundingSource {
    pub fn new(opportunities: Vec<Opportunity>) -> Self {
        Self {
            opportunities: RwLock::new(opportunities),
        }
    }

    pub fn set(&self, opportunities: Vec<Opportunity>) {
        *self.opportunities.write() = opportunities;
    }

    /// Shift the divergence of every opportunity for `symbol`; lets tests
    /// flip funding on an open position.
    pub fn set_divergence(&self, symbol: &str, divergence: Decimal) {
        let mut opportunities = self.opportunities.write();
        for o in opportunities.iter_mut() {
            if o.symbol == symbol {
                o.divergence = divergence;
                o.short_rate = o.long_rate + divergence;
            }
        }
    }
}

#[async_trait]
impl FundingSource for StaticFundingSource {
    async fn opportunities(&self, query: &OpportunityQuery) -> Result<Vec<Opportunity>> {
        let all = self.opportunities.read().clone();
        Ok(all
            .into_iter()
            .filter(|o| {
                query
                    .min_profit
                    .map(|min| o.net_apy >= min)
                    .unwrap_or(true)
                    && query
                        .max_oi_usd
                        .map(|max| o.long_oi_usd.max(o.short_oi_usd) <= max)
                        .unwrap_or(true)
                    && (query.symbols.is_empty() || query.symbols.contains(&o.symbol))
                    && (query.dexes.is_empty()
                        || (query.dexes.contains(&o.long_venue)
                            && query.dexes.contains(&o.short_venue)))
            })
            .collect())
    }

    async fn compare(&self, symbol: &str, dex1: &str, dex2: &str) -> Result<RateComparison> {
        use rust_decimal::prelude::ToPrimitive;
        let opportunities = self.opportunities.read();
        let found = opportunities.iter().find(|o| {
            o.symbol == symbol
                && ((o.long_venue == dex1 && o.short_venue == dex2)
                    || (o.long_venue == dex2 && o.short_venue == dex1))
        });
        match found {
            Some(o) => Ok(RateComparison {
                divergence: o.divergence.to_f64().unwrap_or(0.0),
                long_rate: o.long_rate.to_f64().unwrap_or(0.0),
                short_rate: o.short_rate.to_f64().unwrap_or(0.0),
            }),
            // No live divergence between these venues right now.
            None => Ok(RateComparison {
                divergence: 0.0,
                long_rate: 0.0,
                short_rate: 0.0,
            }),
        }
    }

    async fn best(&self, symbol: &str) -> Result<Option<Opportunity>> {
        let opportunities = self.opportunities.read();
        Ok(opportunities
            .iter()
            .filter(|o| o.symbol == symbol)
            .max_by(|a, b| a.net_apy.cmp(&b.net_apy))
            .cloned())
    }
}
