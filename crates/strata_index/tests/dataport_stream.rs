//! Dataport end-to-end scenarios over real loopback connections.
//!
//! Each test plays an upstream router against a live server: the first frame
//! is always a `VbConnectionMap`, followed by `VbKeyVersions` batches. The
//! assertions cover the mutation-channel ordering, the sideband events for
//! remote faults, and the fatal duplicate-stream policy.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use strata_index::dataport::{DataportConfig, RestartVbuckets, Server, SidebandEvent};
use strata_index::payload::{
    DataportPayload, KeyVersions, VbConnectionMap, VbKeyVersions, CMD_STREAM_BEGIN, CMD_UPSERT,
};
use strata_index::transport::DataportCodec;

const WAIT: Duration = Duration::from_secs(5);

type Mutations = mpsc::Receiver<Vec<VbKeyVersions>>;
type Sideband = mpsc::UnboundedReceiver<SidebandEvent>;

async fn start_server(read_deadline: Duration) -> (Server, Mutations, Sideband) {
    let (mutch_tx, mutch_rx) = mpsc::channel(16);
    let (sbch_tx, sbch_rx) = mpsc::unbounded_channel();
    let cfg = DataportConfig {
        read_deadline,
        ..DataportConfig::default()
    };
    let server = Server::new("127.0.0.1:0", cfg, mutch_tx, sbch_tx)
        .await
        .unwrap();
    (server, mutch_rx, sbch_rx)
}

async fn connect(server: &Server) -> Framed<TcpStream, DataportCodec> {
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    Framed::new(stream, DataportCodec::new(1 << 20))
}

fn vbmap(bucket: &str, vbuckets: Vec<u16>) -> DataportPayload {
    DataportPayload::VbMap(VbConnectionMap {
        bucket: bucket.to_string(),
        vbuckets,
    })
}

fn batch(bucket: &str, vbucket: u16, kvs: Vec<KeyVersions>) -> DataportPayload {
    DataportPayload::Batch(vec![VbKeyVersions {
        bucket: bucket.to_string(),
        vbucket,
        vbuuid: 0,
        kvs,
    }])
}

#[tokio::test]
async fn mutation_batches_arrive_in_order_without_sideband_noise() {
    let (server, mut mutch, mut sbch) = start_server(Duration::from_secs(5)).await;
    let mut router = connect(&server).await;

    router.send(vbmap("b", vec![0, 1, 2])).await.unwrap();
    router
        .send(batch("b", 0, vec![KeyVersions::new(1, vec![CMD_STREAM_BEGIN])]))
        .await
        .unwrap();
    router
        .send(batch("b", 0, vec![KeyVersions::new(2, vec![CMD_UPSERT])]))
        .await
        .unwrap();

    let first = timeout(WAIT, mutch.recv()).await.unwrap().unwrap();
    assert_eq!(first[0].kvs[0].seqno, 1);
    let second = timeout(WAIT, mutch.recv()).await.unwrap().unwrap();
    assert_eq!(second[0].kvs[0].seqno, 2);

    // An empty batch flows through with no control consequences.
    router.send(DataportPayload::Batch(Vec::new())).await.unwrap();
    let third = timeout(WAIT, mutch.recv()).await.unwrap().unwrap();
    assert!(third.is_empty());

    // The stream-begin folded silently: vb 0 was already registered by the
    // vbmap, so nothing appears on the sideband.
    sleep(Duration::from_millis(200)).await;
    assert!(sbch.try_recv().is_err());

    server.close().await.unwrap();
}

#[tokio::test]
async fn remote_timeout_closes_host_and_reports_restart_vbuckets() {
    let (server, _mutch, mut sbch) = start_server(Duration::from_millis(300)).await;
    let mut router = connect(&server).await;
    router.send(vbmap("b", vec![0, 1, 2])).await.unwrap();

    // The router goes silent; the per-read deadline expires and every
    // connection with that host is closed.
    let event = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        SidebandEvent::Restart(vec![RestartVbuckets {
            bucket: "b".to_string(),
            vbuckets: vec![0, 1, 2],
        }])
    );
}

#[tokio::test]
async fn duplicate_stream_begin_is_fatal_for_the_daemon() {
    let (server, mut mutch, mut sbch) = start_server(Duration::from_secs(5)).await;

    let mut router_a = connect(&server).await;
    router_a.send(vbmap("b", vec![7])).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    // A second connection claims vb 7 via stream-begin.
    let mut router_b = connect(&server).await;
    router_b.send(vbmap("b", vec![])).await.unwrap();
    router_b
        .send(batch("b", 7, vec![KeyVersions::new(1, vec![CMD_STREAM_BEGIN])]))
        .await
        .unwrap();

    // The offending batch was published before the control message.
    let published = timeout(WAIT, mutch.recv()).await.unwrap().unwrap();
    assert_eq!(published[0].vbucket, 7);

    let diagnostic = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert!(matches!(diagnostic, SidebandEvent::ConnError { .. }));
    let shutdown = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert_eq!(
        shutdown,
        SidebandEvent::Shutdown(vec![RestartVbuckets {
            bucket: "b".to_string(),
            vbuckets: vec![7],
        }])
    );

    // The daemon took itself down.
    timeout(WAIT, server.done()).await.unwrap();
}

#[tokio::test]
async fn empty_vbmap_registers_no_vbuckets() {
    let (server, _mutch, mut sbch) = start_server(Duration::from_secs(5)).await;
    let mut router = connect(&server).await;
    router.send(vbmap("b", vec![])).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    drop(router);

    // Closing the connection restarts nothing: no vbuckets were registered.
    let event = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert_eq!(event, SidebandEvent::Restart(Vec::new()));
    server.close().await.unwrap();
}

#[tokio::test]
async fn malformed_frame_shuts_the_daemon_down() {
    let (server, _mutch, mut sbch) = start_server(Duration::from_secs(5)).await;
    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();

    // Unknown encoding selector in the flags byte.
    raw.write_all(&[0x7, 0, 0, 0, 2, b'{', b'}']).await.unwrap();
    raw.flush().await.unwrap();

    let diagnostic = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert!(matches!(diagnostic, SidebandEvent::ConnError { .. }));
    let shutdown = timeout(WAIT, sbch.recv()).await.unwrap().unwrap();
    assert_eq!(shutdown, SidebandEvent::Shutdown(Vec::new()));
    timeout(WAIT, server.done()).await.unwrap();
}
