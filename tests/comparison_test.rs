pub mod utils;

use crate::utils::test_utils::{setup_tracing, share_secrets, LocalParties};
use shamir_rounds::{
    common::field::DEFAULT_FIELD_SIZE,
    engine::ops::{split_numbers, LessThanKeys},
    FAILED_RESULT,
};

const P: i64 = DEFAULT_FIELD_SIZE;

#[tokio::test]
async fn power_by_square_and_multiply() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    let shares = share_secrets(&parties.sharing, &[3, 10]);
    let cases = [
        (0, 5, 243),
        (0, 0, 1),
        (0, 1, 3),
        (1, 6, 1_000_000),
        (0, 13, 1_594_323),
    ];

    parties.schedule(|engine, party| {
        engine.initialize_all(cases.len())?;
        for (id, (secret, exponent, _)) in cases.iter().enumerate() {
            engine.power(id, shares[party][*secret], *exponent)?;
        }
        Ok(())
    });
    // bounded by the longest chain, x^13
    assert_eq!(parties.run().await.unwrap(), 4);

    for (id, (_, _, expected)) in cases.iter().enumerate() {
        assert_eq!(parties.open(id), vec![*expected]);
    }
}

#[tokio::test]
async fn power_rounds_follow_the_exponent() {
    setup_tracing();
    // floor(log2 e), plus one unless e is a power of two
    for (exponent, rounds) in [(1, 0), (3, 2), (4, 2), (5, 3), (8, 3), (13, 4)] {
        let parties = LocalParties::new(3, None);
        let shares = share_secrets(&parties.sharing, &[2]);
        parties.schedule(|engine, party| {
            engine.initialize_all(1)?;
            engine.power(0, shares[party][0], exponent)
        });
        let taken = parties.run().await.unwrap();
        assert_eq!(taken, rounds, "exponent {exponent}");
        assert_eq!(parties.open(0), vec![2i64.pow(exponent as u32)]);
    }
}

#[tokio::test]
async fn equality_test() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    let shares = share_secrets(&parties.sharing, &[5, 5, 6, 0]);
    let cases = [(0, 1, 1), (0, 2, 0), (2, 0, 0), (3, 3, 1), (3, 0, 0)];

    parties.schedule(|engine, party| {
        engine.initialize(2, cases.len())?;
        for (id, (left, right, _)) in cases.iter().enumerate() {
            engine.equal(id, shares[party][*left], shares[party][*right])?;
        }
        Ok(())
    });
    parties.run().await.unwrap();

    for (id, (_, _, expected)) in cases.iter().enumerate() {
        assert_eq!(parties.open(id), vec![*expected], "case {id}");
    }
}

#[tokio::test]
async fn less_than_with_supplied_numbers() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    let values = [3, 10, 7, P / 2, P / 2 + 1, P - 1, 0];
    let shares = share_secrets(&parties.sharing, &values);
    // indices into `values`
    let cases = [
        (0, 1),
        (1, 0),
        (2, 2),
        (3, 4),
        (4, 3),
        (6, 5),
        (5, 6),
        (0, 5),
    ];

    parties.schedule(|engine, party| {
        engine.initialize(4, cases.len())?;
        for (id, (left, right)) in cases.iter().enumerate() {
            engine.less_than(
                id,
                shares[party][*left],
                shares[party][*right],
                LessThanKeys::default(),
            )?;
        }
        Ok(())
    });
    for (_, engine) in parties.alive() {
        assert_eq!(engine.random_numbers_needed(), 3 * cases.len());
    }
    parties.run().await.unwrap();

    for (id, (left, right)) in cases.iter().enumerate() {
        let expected = (values[*left] < values[*right]) as i64;
        assert_eq!(parties.open(id), vec![expected], "case {id}");
    }
}

#[tokio::test]
async fn less_than_reuses_cached_predicates() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    let shares = share_secrets(&parties.sharing, &[100, 200, 50]);
    let keys = LessThanKeys {
        left: Some(1),
        right: Some(2),
        difference: None,
    };

    parties.schedule(|engine, party| {
        engine.initialize_all(1)?;
        engine.less_than(0, shares[party][0], shares[party][1], keys)
    });
    // one number per predicate, nothing is cached yet
    assert_eq!(parties.random_numbers_needed(), 3);
    parties.run().await.unwrap();
    assert_eq!(parties.open(0), vec![1]);
    for (_, engine) in parties.alive() {
        assert_eq!(engine.predicates().len(), 2);
    }

    // same left operand, new right one
    let keys = LessThanKeys {
        left: Some(1),
        right: Some(3),
        difference: None,
    };
    parties.schedule(|engine, party| {
        engine.initialize_all(1)?;
        engine.less_than(0, shares[party][0], shares[party][2], keys)
    });
    // the predicate of the left operand is reused
    assert_eq!(parties.random_numbers_needed(), 2);
    parties.run().await.unwrap();
    assert_eq!(parties.open(0), vec![0]);
    for (_, engine) in parties.alive() {
        assert_eq!(engine.predicates().len(), 3);
    }
}

#[tokio::test]
async fn less_than_without_numbers_is_correct_or_failed() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    let shares = share_secrets(&parties.sharing, &[17, 4]);
    let keys = LessThanKeys::default();
    parties.schedule(|engine, party| {
        engine.initialize_all(2)?;
        engine.less_than(0, shares[party][0], shares[party][1], keys)?;
        engine.less_than(1, shares[party][1], shares[party][0], keys)
    });
    parties.run_batch().await.unwrap();

    for (id, expected) in [(0, 0), (1, 1)] {
        let failed: Vec<bool> = parties
            .alive()
            .map(|(_, engine)| engine.result(id).unwrap() == vec![FAILED_RESULT])
            .collect();
        // the attempt fails or succeeds for everyone
        assert!(failed.iter().all(|f| *f == failed[0]));
        if !failed[0] {
            assert_eq!(parties.open(id), vec![expected]);
        }
    }
}

#[tokio::test]
async fn random_bits_are_bits() {
    setup_tracing();
    let parties = LocalParties::new(5, Some(2));
    parties.schedule(|engine, _| {
        engine.initialize_all(1)?;
        engine.generate_random_bits(0, 32)
    });
    assert_eq!(parties.run().await.unwrap(), 3);

    let bits = parties.open(0);
    assert_eq!(bits.len(), 32);
    assert!(bits.iter().all(|bit| *bit == 0 || *bit == 1));
    assert!(bits.contains(&0) && bits.contains(&1));
}

#[tokio::test]
async fn bitwise_random_numbers_match_their_bits() {
    setup_tracing();
    let parties = LocalParties::new(3, None);
    parties.schedule(|engine, _| {
        engine.initialize_all(1)?;
        engine.generate_bitwise_random_numbers(0, 5)
    });
    parties.run().await.unwrap();

    let width = parties.sharing.field().bit_length();
    let numbers = split_numbers(&parties.open(0), width);
    assert_eq!(numbers.len(), 5);
    for number in numbers {
        let (value, bits) = number.split_first().unwrap();
        assert!(bits.iter().all(|bit| *bit == 0 || *bit == 1));
        let recomposed = bits
            .iter()
            .rev()
            .fold(0i64, |acc, bit| acc * 2 + bit);
        assert_eq!(recomposed, *value);
        assert!(*value < P);
    }
}
