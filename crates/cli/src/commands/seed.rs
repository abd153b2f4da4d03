use chrono::Utc;

use leadflow_core::config::{AppConfig, LoadOptions};
use leadflow_core::dispatch::DispatchEngine;
use leadflow_core::domain::lead::{
    LeadConversation, LeadId, LeadState, LeadType, Motivation, PriceExpectation, Timeline,
};
use leadflow_core::domain::message::{Channel, IdempotencyKey};
use leadflow_db::repositories::{
    ConversationRepository, MessageRepository, SqlConversationRepository, SqlMessageRepository,
};
use leadflow_db::{connect_with_settings, migrations};

use crate::commands::CommandResult;

/// Deterministic demo dataset: a hot buyer with a pending welcome send and
/// a seller resting in nurture. Safe to run repeatedly — inserts tolerate
/// existing rows and the send is idempotently keyed.
pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let conversations = SqlConversationRepository::new(pool.clone());
        let messages = SqlMessageRepository::new(pool.clone());
        let engine = DispatchEngine::with_config(config.orchestrator.dispatch_config());
        let now = Utc::now();

        let buyer_id = LeadId("demo-buyer-001".to_string());
        let mut buyer = LeadConversation::new(buyer_id.clone(), LeadType::Buyer, -300, now);
        buyer.state = LeadState::Qualifying;
        buyer.facts.timeline = Some(Timeline::Within30Days);
        buyer.facts.pre_approved = Some(true);
        buyer.facts.motivation = Some(Motivation::Relocation);
        buyer.score = 90;
        conversations
            .insert(buyer)
            .await
            .map_err(|error| ("seed_insert", error.to_string(), 6u8))?;

        let welcome = engine.create_message(
            buyer_id.clone(),
            Channel::Sms,
            "Hi! Thanks for reaching out about your home search. \
             What area are you focused on?",
            IdempotencyKey(format!("{}:welcome", buyer_id.0)),
            now,
            now,
        );
        messages
            .insert_if_absent(welcome)
            .await
            .map_err(|error| ("seed_insert", error.to_string(), 6u8))?;

        let seller_id = LeadId("demo-seller-001".to_string());
        let mut seller = LeadConversation::new(seller_id, LeadType::Seller, 0, now);
        seller.state = LeadState::Nurture;
        seller.facts.timeline = Some(Timeline::ThisYear);
        seller.facts.price_expectation = Some(PriceExpectation::Optimistic);
        seller.score = 48;
        seller.unanswered_sends = 3;
        seller.followup_at = Some(now + chrono::Duration::days(14));
        conversations
            .insert(seller)
            .await
            .map_err(|error| ("seed_insert", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "seed",
            "loaded demo fixtures: demo-buyer-001 (qualifying, welcome pending), \
             demo-seller-001 (nurture)",
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}
