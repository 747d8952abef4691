use std::time::Duration;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use fair_order::crypto::{CipherError, CommutativeKey, KeystreamKey, SraKey};
use fair_order::dev::{AsyncSimulation, Simulation};
use fair_order::order::{
    self, Config, ConfigError, Deck, GameplayOrder, OrderConsensus, Phase, ProtocolError,
    ProtocolMessage, RevealedKey, RunError,
};
use fair_order::router::{Latency, LocalRouter};
use fair_order::{Msg, StateMachine};
use matches::assert_matches;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

type Party<K> = OrderConsensus<K, ChaCha20Rng>;

fn party<K: CommutativeKey>(i: u16, n: u16, seed: u64) -> Party<K> {
    OrderConsensus::with_rng(i, n, ChaCha20Rng::seed_from_u64(seed * 1000 + u64::from(i))).unwrap()
}

fn assert_is_permutation(order: &[u16], n: u16) {
    let mut sorted = order.to_vec();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=n).collect::<Vec<_>>());
}

fn simulate<K: CommutativeKey>(n: u16, seed: u64) -> Vec<Vec<u16>> {
    let mut simulation = Simulation::new();
    for i in 1..=n {
        simulation.add_party(party::<K>(i, n, seed));
    }
    let results = simulation.run().unwrap();

    assert_eq!(simulation.transcript.len(), 2 * usize::from(n));
    for p in &simulation.parties {
        assert_eq!(p.completed_shuffles(), n);
        assert_eq!(p.phase(), Phase::Gone);
    }
    results.into_iter().map(|order| order.into_vec()).collect()
}

#[test]
fn simulated_parties_agree_on_order() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    for results in [simulate::<KeystreamKey>(3, 1), simulate::<SraKey>(3, 1)] {
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_is_permutation(&results[0], 3);
    }
}

#[test]
fn seeded_parties_reproduce_order() {
    for seed in 0..4 {
        assert_eq!(simulate::<KeystreamKey>(4, seed), simulate::<KeystreamKey>(4, seed));
    }
}

async fn agree_with_latency<K: CommutativeKey>(n: u16, latency: Latency) {
    let mut simulation = AsyncSimulation::with_latency(latency);
    simulation.set_timeout(Duration::from_secs(30));
    for i in 1..=n {
        simulation.add_party(OrderConsensus::<K>::new(i, n).unwrap());
    }
    let results = simulation
        .run()
        .await
        .into_iter()
        .map(|r| r.unwrap().into_vec())
        .collect::<Vec<_>>();

    assert_eq!(results.len(), usize::from(n));
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_is_permutation(&results[0], n);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_parties_agree_despite_latency() {
    let latency = Latency::new(Duration::from_millis(2), Duration::from_millis(2));
    for n in 2..=5 {
        // Decks of different senders regularly overtake each other at this jitter
        for _ in 0..20 {
            agree_with_latency::<KeystreamKey>(n, latency).await;
            agree_with_latency::<SraKey>(n, latency).await;
        }
    }
}

/// Opens the last deck of the transcript with the revealed keys
///
/// Returns the order the dealer would expect if parties were sorted by the rank of their card,
/// and the draw of every card recomputed from public data.
fn rank_order<K: CommutativeKey>(
    transcript: &[Msg<ProtocolMessage>],
) -> (Vec<u16>, Vec<Vec<u8>>) {
    let mut last_deck = None;
    let mut secrets = vec![];
    for msg in transcript {
        match &msg.body {
            ProtocolMessage::Shuffled(deck) => last_deck = Some(deck.clone()),
            ProtocolMessage::Revealed(key) => secrets.push((msg.sender, key.as_bytes().to_vec())),
        }
    }
    secrets.sort();
    let secrets = secrets.into_iter().map(|(_, secret)| secret).collect::<Vec<_>>();
    let keys = secrets
        .iter()
        .map(|secret| K::from_bytes(secret).unwrap())
        .collect::<Vec<_>>();

    let mut cards = last_deck.unwrap().into_cards();
    for card in &mut cards {
        for key in &keys {
            key.decrypt(card).unwrap();
        }
    }
    let ranks = cards
        .iter()
        .map(|card| *card.bytes().last().unwrap())
        .collect::<Vec<_>>();

    let mut order = (1..=ranks.len() as u16).collect::<Vec<_>>();
    order.sort_by_key(|&i| ranks[usize::from(i) - 1]);

    let draws = cards
        .iter()
        .map(|card| {
            let mut hasher = Blake2b::<U32>::new();
            for secret in &secrets {
                hasher.update((secret.len() as u64).to_be_bytes());
                hasher.update(secret);
            }
            hasher.update(card.bytes());
            hasher.finalize().to_vec()
        })
        .collect::<Vec<_>>();
    (order, draws)
}

#[test]
fn dealt_ranks_dont_predict_order() {
    let runs = 16;
    let mut predicted = 0;
    for seed in 0..runs {
        let n = 4;
        let mut simulation = Simulation::new();
        for i in 1..=n {
            simulation.add_party(party::<KeystreamKey>(i, n, seed));
        }
        let order = simulation.run().unwrap().remove(0);

        let (by_rank, draws) = rank_order::<KeystreamKey>(&simulation.transcript);
        assert_eq!(order, GameplayOrder::from_draws(&draws));
        if order.parties() == &by_rank[..] {
            predicted += 1;
        }
    }
    assert!(predicted < runs, "order always followed the dealt ranks");
}

/// Drives every party through the start of the protocol and returns the dealt deck
fn deal<K: CommutativeKey>(parties: &mut [Party<K>]) -> Msg<ProtocolMessage> {
    for p in parties.iter_mut() {
        p.proceed().unwrap();
    }
    parties[0].message_queue().remove(0)
}

fn deliver<K: CommutativeKey>(parties: &mut [Party<K>], msg: &Msg<ProtocolMessage>) {
    for p in parties.iter_mut() {
        p.handle_incoming(msg.clone()).unwrap();
    }
}

fn shuffle_by<K: CommutativeKey>(party: &mut Party<K>) -> Msg<ProtocolMessage> {
    assert!(party.wants_to_proceed());
    party.proceed().unwrap();
    party.message_queue().remove(0)
}

#[test]
fn short_deck_is_rejected() {
    let mut parties = (1..=3).map(|i| party::<KeystreamKey>(i, 3, 0)).collect::<Vec<_>>();
    let mut msg = deal(&mut parties);
    let ProtocolMessage::Shuffled(deck) = msg.body else {
        panic!("expected deck")
    };
    let mut cards = deck.into_cards();
    cards.pop();
    msg.body = ProtocolMessage::Shuffled(Deck::from(cards));

    let err = parties[1].handle_incoming(msg).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::WrongDeckSize {
            sender: 1,
            expected: 3,
            actual: 2
        }
    );
    assert_eq!(err.offender(), Some(1));
    assert!(parties[1].is_finished());
}

#[test]
fn overtaking_deck_is_replayed() {
    let mut parties = (1..=3).map(|i| party::<KeystreamKey>(i, 3, 0)).collect::<Vec<_>>();
    let dealt = deal(&mut parties);
    parties[1].handle_incoming(dealt.clone()).unwrap();
    let shuffled = shuffle_by(&mut parties[1]);

    // Party 3 sees deck of party 2 before the dealt one
    parties[2].handle_incoming(shuffled).unwrap();
    assert_eq!(parties[2].turn(), 1);
    assert_eq!(parties[2].completed_shuffles(), 0);

    parties[2].handle_incoming(dealt).unwrap();
    assert_eq!(parties[2].turn(), 3);
    assert_eq!(parties[2].completed_shuffles(), 2);
    assert!(parties[2].wants_to_proceed());
}

#[test]
fn deck_from_finished_turn_is_rejected() {
    let mut parties = (1..=3).map(|i| party::<KeystreamKey>(i, 3, 0)).collect::<Vec<_>>();
    let dealt = deal(&mut parties);
    parties[2].handle_incoming(dealt.clone()).unwrap();

    let err = parties[2].handle_incoming(dealt).unwrap_err();
    assert_eq!(
        err,
        ProtocolError::OutOfTurn {
            sender: 1,
            expected: 2
        }
    );
    assert_eq!(err.offender(), Some(1));
    assert_eq!(parties[2].phase(), Phase::Failed);
}

#[test]
fn altered_own_deck_is_detected() {
    let mut parties = (1..=2).map(|i| party::<KeystreamKey>(i, 2, 0)).collect::<Vec<_>>();
    let mut dealt = deal(&mut parties);
    if let ProtocolMessage::Shuffled(deck) = &mut dealt.body {
        deck.cards_mut()[0].bytes_mut()[0] ^= 1;
    }

    assert_eq!(
        parties[0].handle_incoming(dealt),
        Err(ProtocolError::CorruptedEcho { sender: 1 })
    );
}

/// Runs two parties up to the reveal phase and returns their reveals
fn reach_reveal(parties: &mut [Party<KeystreamKey>]) -> Vec<Msg<ProtocolMessage>> {
    let dealt = deal(parties);
    deliver(parties, &dealt);
    let shuffled = shuffle_by(&mut parties[1]);
    deliver(parties, &shuffled);
    parties
        .iter_mut()
        .map(|p| {
            assert_eq!(p.phase(), Phase::Reveal);
            p.message_queue().remove(0)
        })
        .collect()
}

#[test]
fn substituted_key_breaks_commitment() {
    let mut parties = (1..=2).map(|i| party::<KeystreamKey>(i, 2, 0)).collect::<Vec<_>>();
    let reveals = reach_reveal(&mut parties);
    parties[0].handle_incoming(reveals[0].clone()).unwrap();

    let mut rng = ChaCha20Rng::seed_from_u64(99);
    let forged = Msg {
        sender: 2,
        body: ProtocolMessage::Revealed(RevealedKey::from_key(&KeystreamKey::generate(&mut rng))),
    };
    let err = parties[0].handle_incoming(forged).unwrap_err();
    assert_eq!(err, ProtocolError::CommitmentMismatch { sender: 2 });
    assert_eq!(parties[0].pick_output(), Some(Err(err)));
}

#[test]
fn malformed_key_is_rejected() {
    let mut parties = (1..=2).map(|i| party::<KeystreamKey>(i, 2, 0)).collect::<Vec<_>>();
    reach_reveal(&mut parties);

    let garbage = Msg {
        sender: 2,
        body: ProtocolMessage::Revealed(RevealedKey::new(vec![1, 2, 3])),
    };
    assert_matches!(
        parties[0].handle_incoming(garbage),
        Err(ProtocolError::MalformedKey {
            sender: 2,
            reason: CipherError::MalformedKey(_)
        })
    );
}

#[test]
fn duplicate_reveal_is_rejected() {
    let mut parties = (1..=2).map(|i| party::<KeystreamKey>(i, 2, 0)).collect::<Vec<_>>();
    let reveals = reach_reveal(&mut parties);

    parties[0].handle_incoming(reveals[1].clone()).unwrap();
    assert_eq!(
        parties[0].handle_incoming(reveals[1].clone()),
        Err(ProtocolError::DuplicateReveal { sender: 2 })
    );
}

#[test]
fn early_reveal_waits_for_full_circle() {
    let mut parties = (1..=3).map(|i| party::<SraKey>(i, 3, 5)).collect::<Vec<_>>();
    let dealt = deal(&mut parties);
    deliver(&mut parties, &dealt);
    let second = shuffle_by(&mut parties[1]);
    deliver(&mut parties, &second);
    let third = shuffle_by(&mut parties[2]);

    // Party 1 completes its circle first and reveals before party 2 sees the last deck
    parties[0].handle_incoming(third.clone()).unwrap();
    let early = parties[0].message_queue().remove(0);
    parties[1].handle_incoming(early.clone()).unwrap();
    assert_eq!(parties[1].phase(), Phase::AwaitRound);

    parties[1].handle_incoming(third.clone()).unwrap();
    parties[2].handle_incoming(third).unwrap();
    let mut reveals = vec![early];
    reveals.extend(parties[1..].iter_mut().map(|p| p.message_queue().remove(0)));

    for (i, p) in parties.iter_mut().enumerate() {
        for reveal in &reveals {
            // Party 2 has already got the early reveal
            if i == 1 && reveal.sender == 1 {
                continue;
            }
            p.handle_incoming(reveal.clone()).unwrap();
        }
        assert!(p.wants_to_proceed());
        p.proceed().unwrap();
    }
    let orders = parties
        .iter_mut()
        .map(|p| p.pick_output().unwrap().unwrap())
        .collect::<Vec<_>>();
    assert!(orders.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn lone_party_times_out() {
    let router = LocalRouter::new();
    let delivery = router.register_now().unwrap();
    let config = Config::new(2, 2).with_deadline(Duration::from_millis(200));

    let err = order::run::<KeystreamKey, _>(&config, delivery)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(
        err.protocol_error(),
        Some(&ProtocolError::Timeout { missing: vec![1] })
    );
}

#[tokio::test]
async fn invalid_config_fails_before_sending() {
    let router = LocalRouter::new();
    let delivery = router.register_now().unwrap();

    let err = order::run::<SraKey, _>(&Config::new(3, 2), delivery)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        RunError::Config(ConfigError::IndexOutOfRange {
            index: 3,
            parties: 2
        })
    );
}
