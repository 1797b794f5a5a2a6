//! A session over a real TCP socket.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::BytesMut;
use iscsi_initiator::{
    Opcode,
    Session,
    TcpConnector,
    TcpTransport,
    Transport,
    digest::Digests,
    pdu::{BHS_LEN, codec},
    transport::Connector,
};
use iscsi_testing::{
    TestResult,
    pdus::{self, Window},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

async fn listener() -> TestResult<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

#[tokio::test]
async fn login_round_trip_over_tcp() -> TestResult {
    let (listener, addr) = listener().await?;
    let transport = TcpTransport::connect(addr).await?;
    let (mut socket, _) = listener.accept().await?;
    let session = Session::builder().start(transport)?;

    let itt = session.send_control(pdus::login_request())?;
    let mut raw = BytesMut::zeroed(BHS_LEN);
    socket.read_exact(&mut raw).await?;
    let login = codec::decode_frame(&mut raw, &Digests::none(), 8192)?.ok_or("short login frame")?;
    assert_eq!(login.opcode(), Ok(Opcode::Login));
    assert_eq!(login.itt(), itt);

    let response = codec::encode(&pdus::login_response(itt, Window::default()), &Digests::none());
    socket.write_all(&response.to_bytes()).await?;
    let reply = session.recv_response().await?;
    assert_eq!(reply.opcode(), Ok(Opcode::LoginResponse));

    let report = session.shutdown().await?;
    assert!(report.is_clean());
    let mut rest = Vec::new();
    assert_eq!(socket.read_to_end(&mut rest).await?, 0);
    Ok(())
}

#[tokio::test]
async fn connector_dials_configured_address() -> TestResult {
    let (listener, addr) = listener().await?;
    let connector = TcpConnector::new(addr.to_string());
    let (transport, accepted) = tokio::join!(connector.connect(), listener.accept());
    let transport = transport?;
    let (mut socket, _) = accepted?;

    transport.send(&[bytes::Bytes::from_static(b"ping")]).await?;
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");
    transport.close().await?;
    Ok(())
}
