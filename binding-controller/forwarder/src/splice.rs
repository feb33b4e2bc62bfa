use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Relays bytes between `a` and `b` in both directions.
///
/// Returns as soon as either direction reaches EOF or fails; the other
/// direction is abandoned and both streams are dropped, closing them.
pub async fn splice<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rx, mut a_tx) = io::split(a);
    let (mut b_rx, mut b_tx) = io::split(b);

    let a_to_b = async {
        let n = io::copy(&mut a_rx, &mut b_tx).await?;
        let _ = b_tx.shutdown().await;
        tracing::trace!(bytes = n, "Client closed");
        Ok::<_, io::Error>(())
    };
    let b_to_a = async {
        let n = io::copy(&mut b_rx, &mut a_tx).await?;
        let _ = a_tx.shutdown().await;
        tracing::trace!(bytes = n, "Upstream closed");
        Ok::<_, io::Error>(())
    };

    tokio::select! {
        res = a_to_b => res,
        res = b_to_a => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn relays_both_ways() {
        let (mut client, client_peer) = duplex(64);
        let (mut upstream, upstream_peer) = duplex(64);
        let task = tokio::spawn(splice(client_peer, upstream_peer));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_one_side_closes_both() {
        let (client, client_peer) = duplex(64);
        let (mut upstream, upstream_peer) = duplex(64);
        let task = tokio::spawn(splice(client_peer, upstream_peer));

        drop(client);
        task.await.unwrap().unwrap();

        let mut buf = Vec::new();
        let n = upstream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0, "upstream must observe EOF");
    }

    #[tokio::test]
    async fn upstream_close_ends_splice() {
        let (mut client, client_peer) = duplex(64);
        let (mut upstream, upstream_peer) = duplex(64);
        let task = tokio::spawn(splice(client_peer, upstream_peer));

        upstream.write_all(b"bye").await.unwrap();
        drop(upstream);
        task.await.unwrap().unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
