//! Pricing configuration and the usage cost calculator.
//!
//! Token prices are expressed in credits per one million tokens. A usage event
//! is billed either by tokens or by a flat per-request price, never both.
//! Feature surcharges and custom fees are added on top and the total is
//! floored at the model's minimum cost before being rounded up to ledger
//! precision.

use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::ledger::round_charge;

/// Number of tokens one token price applies to.
pub const TOKENS_PER_PRICE_UNIT: u64 = 1_000_000;

/// Pricing configuration for all billable usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Pricing by model ID.
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,

    /// Pricing for models without their own entry.
    pub default_model: ModelPricing,

    /// Per-request price of each optional feature, by feature name.
    #[serde(default)]
    pub feature_prices: HashMap<String, Decimal>,

    /// Pricing for embedding requests, whatever model serves them.
    #[serde(default = "default_embedding")]
    pub embedding: ModelPricing,
}

fn default_embedding() -> ModelPricing {
    ModelPricing::per_token(Decimal::from(100), Decimal::ZERO, Decimal::ZERO)
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut feature_prices = HashMap::new();
        feature_prices.insert("image_generation".to_string(), Decimal::new(5, 1));
        feature_prices.insert("code_interpreter".to_string(), Decimal::new(1, 1));
        feature_prices.insert("web_search".to_string(), Decimal::new(2, 1));
        feature_prices.insert("direct_tool_servers".to_string(), Decimal::new(1, 1));

        Self {
            models: HashMap::new(),
            default_model: ModelPricing {
                prompt_per_million: Decimal::from(1000),
                prompt_cache_per_million: Decimal::from(250),
                completion_per_million: Decimal::from(3000),
                request_price: Decimal::ONE,
                minimum_cost: Decimal::ZERO,
            },
            feature_prices,
            embedding: default_embedding(),
        }
    }
}

impl PricingConfig {
    /// Look up the pricing for a model, falling back to the default pricing.
    #[must_use]
    pub fn model(&self, model: &str) -> &ModelPricing {
        self.models.get(model).unwrap_or(&self.default_model)
    }

    /// Look up the pricing for a request. Embedding requests all share
    /// [`embedding`](Self::embedding).
    #[must_use]
    pub fn pricing_for(&self, model: &str, embedding: bool) -> &ModelPricing {
        if embedding {
            &self.embedding
        } else {
            self.model(model)
        }
    }

    /// Set the pricing for a model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    /// Set the per-request price of a feature.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>, price: Decimal) -> Self {
        self.feature_prices.insert(feature.into(), price);
        self
    }

    /// Check every configured price for negative values.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` naming the first negative price.
    pub fn validate(&self) -> Result<()> {
        self.default_model.validate("default")?;
        self.embedding.validate("embedding")?;
        for (name, pricing) in &self.models {
            pricing.validate(name)?;
        }
        for (feature, price) in &self.feature_prices {
            if price.is_sign_negative() {
                return Err(CreditError::Validation(format!(
                    "feature price for {feature} must not be negative"
                )));
            }
        }
        Ok(())
    }

    /// Sum the prices of the requested features.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a feature without a configured price.
    pub fn feature_cost(&self, features: &BTreeSet<String>) -> Result<Decimal> {
        features.iter().try_fold(Decimal::ZERO, |total, feature| {
            self.feature_prices
                .get(feature)
                .map(|price| total + price)
                .ok_or_else(|| CreditError::Validation(format!("unknown feature: {feature}")))
        })
    }

    /// Check whether a request against `model` with `features` costs nothing.
    ///
    /// Free requests skip the balance pre-check entirely.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a feature without a configured price.
    pub fn is_free(&self, model: &str, features: &BTreeSet<String>) -> Result<bool> {
        self.is_free_with(self.model(model), features)
    }

    /// Check whether a request priced by `pricing` with `features` costs nothing.
    ///
    /// Feature names are validated even when the model itself is paid.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a feature without a configured price.
    pub fn is_free_with(&self, pricing: &ModelPricing, features: &BTreeSet<String>) -> Result<bool> {
        let features = self.feature_cost(features)?;
        Ok(pricing.is_free() && features.is_zero())
    }

    /// Calculate the cost of a usage event.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` if the usage names an unknown feature.
    pub fn calculate(&self, model: &str, usage: &UsageDescriptor) -> Result<CostBreakdown> {
        let pricing = self.pricing_for(model, usage.embedding);

        let (base, billed_by) = if usage.per_request {
            (pricing.request_price, BilledBy::Request)
        } else {
            (pricing.token_cost(&usage.tokens), BilledBy::Tokens)
        };

        let features = self.feature_cost(&usage.features)?;
        let custom_fees: Decimal = usage.custom_fees.iter().map(|fee| fee.amount).sum();

        let raw = base + features + custom_fees;
        let floored = raw.max(pricing.minimum_cost);

        Ok(CostBreakdown {
            base,
            features,
            custom_fees,
            minimum_applied: floored > raw,
            total: round_charge(floored),
            billed_by,
        })
    }
}

/// Prices for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Credits per one million uncached prompt tokens.
    pub prompt_per_million: Decimal,

    /// Credits per one million cached prompt tokens.
    pub prompt_cache_per_million: Decimal,

    /// Credits per one million completion tokens.
    pub completion_per_million: Decimal,

    /// Flat credits per request, used instead of token billing.
    pub request_price: Decimal,

    /// No usage event is billed below this amount.
    #[serde(default)]
    pub minimum_cost: Decimal,
}

impl ModelPricing {
    /// Pricing billed by tokens only.
    #[must_use]
    pub fn per_token(prompt: Decimal, cache: Decimal, completion: Decimal) -> Self {
        Self {
            prompt_per_million: prompt,
            prompt_cache_per_million: cache,
            completion_per_million: completion,
            request_price: Decimal::ZERO,
            minimum_cost: Decimal::ZERO,
        }
    }

    /// Set the flat per-request price.
    #[must_use]
    pub fn with_request_price(mut self, price: Decimal) -> Self {
        self.request_price = price;
        self
    }

    /// Set the minimum cost.
    #[must_use]
    pub fn with_minimum_cost(mut self, minimum: Decimal) -> Self {
        self.minimum_cost = minimum;
        self
    }

    /// Token-based cost at full precision.
    #[must_use]
    pub fn token_cost(&self, tokens: &TokenUsage) -> Decimal {
        let unit = Decimal::from(TOKENS_PER_PRICE_UNIT);
        let uncached = Decimal::from(tokens.uncached_prompt_tokens());
        let cached = Decimal::from(tokens.cached_tokens);
        let completion = Decimal::from(tokens.completion_tokens);

        (self.prompt_per_million * uncached
            + self.prompt_cache_per_million * cached
            + self.completion_per_million * completion)
            / unit
    }

    /// Check whether every price of this model is zero.
    #[must_use]
    pub fn is_free(&self) -> bool {
        [
            self.prompt_per_million,
            self.prompt_cache_per_million,
            self.completion_per_million,
            self.request_price,
            self.minimum_cost,
        ]
        .iter()
        .all(Decimal::is_zero)
    }

    fn validate(&self, name: &str) -> Result<()> {
        let prices = [
            self.prompt_per_million,
            self.prompt_cache_per_million,
            self.completion_per_million,
            self.request_price,
            self.minimum_cost,
        ];
        if prices.iter().any(Decimal::is_sign_negative) {
            return Err(CreditError::Validation(format!(
                "pricing for model {name} contains a negative price"
            )));
        }
        Ok(())
    }
}

/// Token counts reported for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTokenUsage")]
pub struct TokenUsage {
    /// Prompt tokens, including cached ones.
    pub prompt_tokens: u64,

    /// Completion tokens.
    pub completion_tokens: u64,

    /// Prompt tokens served from the provider's prompt cache.
    pub cached_tokens: u64,
}

impl TokenUsage {
    /// Validate and build token counts.
    ///
    /// Counts arrive from upstream providers as signed integers; negative
    /// values and more cached tokens than prompt tokens are rejected.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for malformed counts.
    pub fn new(prompt_tokens: i64, completion_tokens: i64, cached_tokens: i64) -> Result<Self> {
        let count = |name: &str, value: i64| {
            u64::try_from(value)
                .map_err(|_| CreditError::Validation(format!("{name} must not be negative")))
        };
        let prompt_tokens = count("prompt_tokens", prompt_tokens)?;
        let completion_tokens = count("completion_tokens", completion_tokens)?;
        let cached_tokens = count("cached_tokens", cached_tokens)?;

        if cached_tokens > prompt_tokens {
            return Err(CreditError::Validation(format!(
                "cached_tokens ({cached_tokens}) exceeds prompt_tokens ({prompt_tokens})"
            )));
        }

        Ok(Self {
            prompt_tokens,
            completion_tokens,
            cached_tokens,
        })
    }

    /// Prompt tokens billed at the standard rate.
    #[must_use]
    pub const fn uncached_prompt_tokens(&self) -> u64 {
        self.prompt_tokens - self.cached_tokens
    }

    /// Prompt plus completion tokens.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Deserialize)]
struct RawTokenUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    cached_tokens: i64,
}

impl TryFrom<RawTokenUsage> for TokenUsage {
    type Error = CreditError;

    fn try_from(raw: RawTokenUsage) -> Result<Self> {
        Self::new(raw.prompt_tokens, raw.completion_tokens, raw.cached_tokens)
    }
}

/// A named fee added to a usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCustomFee")]
pub struct CustomFee {
    /// Fee name, recorded in the ledger entry.
    pub name: String,

    /// Fee amount in credits.
    pub amount: Decimal,
}

impl CustomFee {
    /// Validate and build a fee.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for an empty name or a negative amount.
    pub fn new(name: impl Into<String>, amount: Decimal) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CreditError::Validation("fee name must not be empty".into()));
        }
        if amount.is_sign_negative() {
            return Err(CreditError::Validation(format!(
                "fee {name} must not be negative"
            )));
        }
        Ok(Self { name, amount })
    }
}

#[derive(Deserialize)]
struct RawCustomFee {
    name: String,
    amount: Decimal,
}

impl TryFrom<RawCustomFee> for CustomFee {
    type Error = CreditError;

    fn try_from(raw: RawCustomFee) -> Result<Self> {
        Self::new(raw.name, raw.amount)
    }
}

/// Everything needed to price one usage event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDescriptor {
    /// Token counts.
    #[serde(default)]
    pub tokens: TokenUsage,

    /// Bill a flat per-request price instead of tokens.
    #[serde(default)]
    pub per_request: bool,

    /// An embedding request, priced by [`PricingConfig::embedding`].
    #[serde(default)]
    pub embedding: bool,

    /// Enabled features.
    #[serde(default)]
    pub features: BTreeSet<String>,

    /// Additional named fees.
    #[serde(default)]
    pub custom_fees: Vec<CustomFee>,
}

impl UsageDescriptor {
    /// Usage billed by tokens.
    #[must_use]
    pub fn tokens(tokens: TokenUsage) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }

    /// Embedding usage billed by prompt tokens.
    #[must_use]
    pub fn embedding(prompt_tokens: u64) -> Self {
        Self {
            tokens: TokenUsage {
                prompt_tokens,
                ..TokenUsage::default()
            },
            embedding: true,
            ..Self::default()
        }
    }

    /// Usage billed by a flat per-request price.
    #[must_use]
    pub fn per_request() -> Self {
        Self {
            per_request: true,
            ..Self::default()
        }
    }

    /// Enable a feature.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Add a custom fee.
    #[must_use]
    pub fn with_fee(mut self, fee: CustomFee) -> Self {
        self.custom_fees.push(fee);
        self
    }
}

/// How the base cost of a usage event was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BilledBy {
    /// Prompt, cached and completion tokens.
    Tokens,
    /// Flat per-request price.
    Request,
}

/// The result of pricing a usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Token or flat cost, at full precision.
    pub base: Decimal,

    /// Sum of feature prices.
    pub features: Decimal,

    /// Sum of custom fees.
    pub custom_fees: Decimal,

    /// Whether the model's minimum cost replaced the computed cost.
    pub minimum_applied: bool,

    /// Amount to charge, rounded up to ledger precision.
    pub total: Decimal,

    /// How the base cost was computed.
    pub billed_by: BilledBy,
}
