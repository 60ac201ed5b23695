mod common;

use chrono::Duration;
use std::path::PathBuf;

use common::*;
use prediction_market_ledger::config::Config;
use prediction_market_ledger::ledger::LedgerStore;
use prediction_market_ledger::market_resolve::markets::NewMarket;
use prediction_market_ledger::AppState;

fn open(path: &PathBuf) -> AppState {
    let config = Config::from_lookup(|_| None).unwrap();
    AppState::from_config(&config, LedgerStore::open(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_balances_and_bets_survive_restart() {
    let path = std::env::temp_dir().join(format!("ledger_{}", uuid::Uuid::new_v4().simple()));

    let market_id = {
        let state = open(&path);
        let market = state
            .markets
            .create_market(NewMarket {
                guild_id: GUILD,
                creator_id: CREATOR,
                question: "Will it snow?".into(),
                options: vec!["Yes".into(), "No".into()],
                duration: Duration::hours(1),
                category: None,
                channel_id: None,
            })
            .unwrap();
        state.markets.place_bet(&market.id, ALICE, "Yes", 900).await.unwrap();
        assert_eq!(state.markets.balance(ALICE).await.unwrap(), 100);
        state.save().await.unwrap();
        market.id
    };

    let state = open(&path);
    assert_eq!(state.markets.balance(ALICE).await.unwrap(), 100);
    assert_eq!(state.markets.balance(BOB).await.unwrap(), 1000);
    assert_eq!(state.markets.bets(&market_id).unwrap().len(), 1);

    let err = state.markets.place_bet(&market_id, ALICE, "No", 200).await.unwrap_err();
    assert!(matches!(
        err,
        prediction_market_ledger::MarketError::InsufficientBalance { available: 100, .. }
    ));

    drop(state);
    let _ = std::fs::remove_dir_all(&path);
}
