mod common;
use common::*;
use sma_bridge::prelude::*;
use sma_bridge::sma::frame::FramedChannel;
use sma_bridge::sma::link::{Command, DeviceLink, LinkState, MAX_DATA_LEN};

#[tokio::test(start_paused = true)]
async fn handshake_completes() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock.clone());

    link.connect().await?;

    assert_eq!(link.state(), LinkState::Connected);
    let info = link.info();
    assert_eq!(info.net_id, NET_ID);
    assert_eq!(info.own_address, own_mac());
    assert_eq!(info.peer_address, inverter_mac());
    assert_eq!(info.devices, vec![inverter_mac()]);

    // the id exchange is echoed to the root device
    let echo = &mock.written()[0];
    assert_eq!(echo.command(), Some(Command::IdExchange));
    assert_eq!(echo.destination, inverter_mac());
    assert_eq!(echo.payload, Factory::hello(inverter_mac()).payload);

    link.close().await;
    assert_eq!(link.state(), LinkState::NotConnected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn early_packets_are_ignored() -> Result<()> {
    common_setup();
    let mock = MockTransport::new();
    mock.push(Factory::address(inverter_mac()));
    mock.push(Factory::topology(inverter_mac(), &[inverter_mac()]));
    for packet in Factory::handshake(&[inverter_mac(), second_mac()]) {
        mock.push(packet);
    }
    let link = DeviceLink::new(mock.clone());

    link.connect().await?;

    let info = link.info();
    assert_eq!(info.own_address, own_mac());
    assert_eq!(info.devices, vec![inverter_mac(), second_mac()]);
    assert_eq!(mock.written().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    common_setup();
    let mock = MockTransport::new();
    mock.push(Factory::hello(inverter_mac()));
    let link = DeviceLink::new(mock);
    let start = tokio::time::Instant::now();

    let result = link.connect().await;

    assert!(matches!(result, Err(Error::HandshakeTimeout)));
    assert_eq!(link.state(), LinkState::Failed);
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert!(link.write(&[1, 2, 3], inverter_mac()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn large_writes_are_split() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock.clone());
    link.connect().await?;

    link.write(&[0x55; 300], inverter_mac()).await?;

    let written = mock.written();
    let data: Vec<_> = written.iter().skip(1).collect();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].command(), Some(Command::DataPart));
    assert_eq!(data[0].payload.len(), 237);
    assert_eq!(data[1].command(), Some(Command::Data));
    assert_eq!(data[1].payload.len(), 63);
    assert!(data.iter().all(|p| p.source == own_mac() && p.destination == inverter_mac()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reads_time_out_empty() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock);
    link.connect().await?;

    assert_eq!(link.read(Duration::from_secs(1)).await?, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reports_signal_strength() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    mock.set_signal(0xCC);
    let link = DeviceLink::new(mock.clone());
    link.connect().await?;

    assert_eq!(link.signal_strength(inverter_mac()).await?, 80);
    let query = mock.written().pop().unwrap();
    assert_eq!(query.command(), Some(Command::SignalQuery));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_signal_report_times_out() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock);
    link.connect().await?;

    assert!(matches!(
        link.signal_strength(inverter_mac()).await,
        Err(Error::Timeout(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn multi_part_reply_in_one_burst() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock.clone());
    link.connect().await?;

    let payload: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
    let answer = Answer {
        source: inverter_mac(),
        payload: payload.clone(),
    };
    let packets = MockTransport::answer_packets(&answer);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].command(), Some(Command::DataPart));
    assert_eq!(packets[0].payload.len(), MAX_DATA_LEN);
    mock.push_answer(answer);

    let mut framed = FramedChannel::new(link);
    let frame = framed.read(Duration::from_secs(2)).await?;
    assert_eq!(frame.source, inverter_mac());
    assert_eq!(&frame.payload[..], &payload[..]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn malformed_header_fails_the_link() -> Result<()> {
    common_setup();
    let mock = MockTransport::with_devices(&[inverter_mac()]);
    let link = DeviceLink::new(mock.clone());
    link.connect().await?;

    // header checksum should be 0x7E ^ 18
    mock.push_raw(vec![0x7E, 18, 0x00, 0x00]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(link.state(), LinkState::Failed);
    assert!(matches!(
        link.read(Duration::from_secs(1)).await,
        Err(Error::Link(_))
    ));
    assert!(matches!(
        link.write(&[1, 2, 3], inverter_mac()).await,
        Err(Error::Link(_))
    ));
    Ok(())
}
