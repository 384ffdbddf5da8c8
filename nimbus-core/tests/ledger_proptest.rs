//! Property tests for the wallet ledger

use std::str::FromStr;

use nimbus_core::ledger::{BalanceChange, Ledger};
use nimbus_core::storage::Store;
use nimbus_core::types::LedgerKind;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Recharge(i64),
    Consume(i64),
    Refund(i64),
}

fn cents(c: i64) -> Decimal {
    Decimal::new(c, 2)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..50_000).prop_map(Op::Recharge),
        (1i64..20_000).prop_map(Op::Consume),
        (1i64..5_000).prop_map(Op::Refund),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_balance_equals_sum_of_accepted_entries(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(Store::open(dir.path()).unwrap());

        let expected = runtime.block_on(async {
            let mut expected = Decimal::ZERO;
            for op in &ops {
                let change = match op {
                    Op::Recharge(c) => BalanceChange::recharge(7, cents(*c), "prop"),
                    Op::Consume(c) => BalanceChange::consume(7, cents(*c), None, "prop"),
                    Op::Refund(c) => BalanceChange::refund(7, cents(*c), None, "prop"),
                };
                match ledger.change_balance(change).await {
                    Ok(entry) => {
                        expected += entry.delta;
                        assert_eq!(entry.balance_after, expected);
                    }
                    Err(e) => {
                        assert!(e.is_insufficient_balance());
                        assert!(matches!(op, Op::Consume(_)));
                    }
                }
                assert!(expected >= Decimal::ZERO);
            }
            expected
        });

        let balance = runtime.block_on(ledger.balance(7)).unwrap();
        prop_assert_eq!(balance, expected);
    }

    #[test]
    fn prop_consume_is_stored_negative(c in 1i64..10_000) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(Store::open(dir.path()).unwrap());

        let entry = runtime.block_on(async {
            ledger.change_balance(BalanceChange::recharge(1, Decimal::from_str("100").unwrap(), "seed")).await.unwrap();
            ledger.change_balance(BalanceChange::consume(1, cents(c), None, "prop")).await.unwrap()
        });

        prop_assert_eq!(entry.kind, LedgerKind::Consume);
        prop_assert_eq!(entry.delta, -cents(c));
        prop_assert_eq!(entry.balance_after, Decimal::from(100) - cents(c));
    }
}
