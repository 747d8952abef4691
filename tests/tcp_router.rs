use std::time::Duration;

use fair_order::crypto::KeystreamKey;
use fair_order::order::{self, Config, ProtocolMessage};
use fair_order::router::{TcpHub, TcpRouter, TcpRouterError};

#[tokio::test(flavor = "multi_thread")]
async fn parties_agree_over_tcp_hub() -> anyhow::Result<()> {
    let hub = TcpHub::bind("127.0.0.1:0").await?;
    let addr = hub.local_addr()?;
    tokio::spawn(hub.run());

    let n = 3;
    let mut deliveries = vec![];
    for i in 1..=n {
        deliveries.push(TcpRouter::new(addr, i).connect::<ProtocolMessage>().await?);
    }

    let mut parties = vec![];
    for (i, delivery) in (1..=n).zip(deliveries) {
        let config = Config::new(i, n).with_deadline(Duration::from_secs(30));
        parties.push(tokio::spawn(async move {
            order::run::<KeystreamKey, _>(&config, delivery).await
        }));
    }

    let mut orders = vec![];
    for party in parties {
        orders.push(party.await??);
    }
    assert!(orders.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(orders[0].parties().len(), usize::from(n));
    Ok(())
}

#[tokio::test]
async fn hub_rejects_taken_index() {
    let hub = TcpHub::bind("127.0.0.1:0").await.unwrap();
    let addr = hub.local_addr().unwrap();
    tokio::spawn(hub.run());

    let _first = TcpRouter::new(addr, 1)
        .connect::<ProtocolMessage>()
        .await
        .unwrap();
    let second = TcpRouter::new(addr, 1).connect::<ProtocolMessage>().await;
    assert!(matches!(
        second,
        Err(TcpRouterError::Rejected { party_i: 1 })
    ));
}
