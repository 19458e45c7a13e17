//! Self-learning heuristic rules (spec C5). Small and stateless aside from
//! its store access, grounded on the scoring-adjustment style of
//! `confidence-calibrator` in the teacher workspace (a numeric multiplier
//! derived from historical validated/invalidated counts).

use anyhow::Result;
use moves_store::Store;
use sqlx::Row;

pub struct SignalContext<'a> {
    pub domain: Option<&'a str>,
    pub is_thesis_based: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Principle {
    pub id: i64,
    pub text: String,
    pub category: String,
    pub validated_count: i64,
    pub invalidated_count: i64,
    pub weight: f64,
    pub active: bool,
}

pub struct PrinciplesEngine {
    store: Store,
}

const AGGREGATE_ADJ_CLAMP: f64 = 0.15;

impl PrinciplesEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn match_principles(&self, context: &SignalContext<'_>) -> Result<Vec<Principle>> {
        let all: Vec<Principle> = sqlx::query_as(
            "SELECT id, text, category, validated_count, invalidated_count, weight, active
             FROM principles WHERE active = 1",
        )
        .fetch_all(self.store.pool())
        .await?;

        Ok(all
            .into_iter()
            .filter(|p| match p.category.as_str() {
                "domain" => context.domain.is_some(),
                "conviction" => context.is_thesis_based,
                _ => true,
            })
            .collect())
    }

    /// Sum of `weight * tanh((validated - invalidated) / (validated + invalidated + 1))`,
    /// clipped to +/-0.15 in aggregate (spec 4.5).
    pub fn apply_to_score(&self, principles: &[Principle]) -> f64 {
        let raw: f64 = principles
            .iter()
            .map(|p| {
                let v = p.validated_count as f64;
                let i = p.invalidated_count as f64;
                p.weight * ((v - i) / (v + i + 1.0)).tanh()
            })
            .sum();
        raw.clamp(-AGGREGATE_ADJ_CLAMP, AGGREGATE_ADJ_CLAMP)
    }

    /// Deactivates a principle once invalidations clearly dominate
    /// validations: `invalidated >= 5 and invalidated > validated + 1`.
    pub async fn deactivate_if_poor(&self, id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT validated_count, invalidated_count FROM principles WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        let Some(row) = row else { return Ok(false) };
        let validated: i64 = row.get("validated_count");
        let invalidated: i64 = row.get("invalidated_count");

        if invalidated >= 5 && invalidated > validated + 1 {
            sqlx::query("UPDATE principles SET active = 0 WHERE id = ?")
                .bind(id)
                .execute(self.store.pool())
                .await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn record_outcome(&self, id: i64, validated: bool) -> Result<()> {
        let column = if validated { "validated_count" } else { "invalidated_count" };
        sqlx::query(&format!("UPDATE principles SET {column} = {column} + 1 WHERE id = ?"))
            .bind(id)
            .execute(self.store.pool())
            .await?;
        self.deactivate_if_poor(id).await?;
        Ok(())
    }
}
