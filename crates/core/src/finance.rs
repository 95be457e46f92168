//! Caller-facing analysis shapes.
//!
//! These are the types the presentation layer speaks. The engine speaks a
//! different shape; converting between the two happens only in the bridge's
//! orchestrator.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// One account movement. Forwarded to the engine as-is.
///
/// `date` is kept as the caller sent it (ISO date or date-time); the bridge
/// never parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: String,
    pub amount: f64,
    pub category: String,
    pub description: String,
}

impl ValueObject for Transaction {}

/// Financial attributes of the user being analysed.
///
/// Opaque to the bridge: fields are forwarded, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub age: u32,
    pub annual_income: f64,
    pub super_balance: f64,
    pub emergency_fund: f64,
    pub investment_assets: f64,
    pub super_contributions: f64,
    pub work_expenses: f64,
    pub investment_diversity: u32,
}

impl ValueObject for UserProfile {}

/// Profile as received from a caller, before presence checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfileInput {
    pub age: Option<u32>,
    pub annual_income: Option<f64>,
    pub super_balance: Option<f64>,
    pub emergency_fund: Option<f64>,
    pub investment_assets: Option<f64>,
    pub super_contributions: Option<f64>,
    pub work_expenses: Option<f64>,
    pub investment_diversity: Option<u32>,
}

impl UserProfileInput {
    /// Require every field; report all absent fields at once.
    pub fn validate(self) -> DomainResult<UserProfile> {
        let mut missing: Vec<String> = Vec::new();

        fn take<T>(value: Option<T>, name: &str, missing: &mut Vec<String>) -> Option<T> {
            if value.is_none() {
                missing.push(format!("userProfile.{name}"));
            }
            value
        }

        let age = take(self.age, "age", &mut missing);
        let annual_income = take(self.annual_income, "annual_income", &mut missing);
        let super_balance = take(self.super_balance, "super_balance", &mut missing);
        let emergency_fund = take(self.emergency_fund, "emergency_fund", &mut missing);
        let investment_assets = take(self.investment_assets, "investment_assets", &mut missing);
        let super_contributions =
            take(self.super_contributions, "super_contributions", &mut missing);
        let work_expenses = take(self.work_expenses, "work_expenses", &mut missing);
        let investment_diversity =
            take(self.investment_diversity, "investment_diversity", &mut missing);

        match (
            age,
            annual_income,
            super_balance,
            emergency_fund,
            investment_assets,
            super_contributions,
            work_expenses,
            investment_diversity,
        ) {
            (
                Some(age),
                Some(annual_income),
                Some(super_balance),
                Some(emergency_fund),
                Some(investment_assets),
                Some(super_contributions),
                Some(work_expenses),
                Some(investment_diversity),
            ) => {
                let profile = UserProfile {
                    age,
                    annual_income,
                    super_balance,
                    emergency_fund,
                    investment_assets,
                    super_contributions,
                    work_expenses,
                    investment_diversity,
                };
                ensure_finite(&profile)?;
                Ok(profile)
            }
            _ => Err(DomainError::missing(missing)),
        }
    }
}

fn ensure_finite(profile: &UserProfile) -> DomainResult<()> {
    let amounts = [
        ("annual_income", profile.annual_income),
        ("super_balance", profile.super_balance),
        ("emergency_fund", profile.emergency_fund),
        ("investment_assets", profile.investment_assets),
        ("super_contributions", profile.super_contributions),
        ("work_expenses", profile.work_expenses),
    ];
    for (name, value) in amounts {
        if !value.is_finite() {
            return Err(DomainError::validation(format!(
                "userProfile.{name} must be a finite number"
            )));
        }
    }
    Ok(())
}

/// Analysis request as received from a caller (`{transactions, userProfile}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequestInput {
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    pub user_profile: Option<UserProfileInput>,
}

impl AnalysisRequestInput {
    /// Structural validation; an empty transaction list is allowed.
    pub fn validate(self) -> DomainResult<AnalysisRequest> {
        let profile = self
            .user_profile
            .ok_or_else(|| DomainError::missing(vec!["userProfile".to_string()]))?
            .validate()?;

        Ok(AnalysisRequest {
            transactions: self.transactions,
            user_profile: profile,
        })
    }
}

/// A validated analysis request. Consumed once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub transactions: Vec<Transaction>,
    pub user_profile: UserProfile,
}

/// What the caller gets back: joined narrative, recommendations, one score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub analysis: String,
    pub recommendations: Vec<String>,
    pub risk_score: f64,
}
