use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use blockfab_cow::upload::UploadConfig;
use blockfab_cow::{CowFile, CowStore, OriginReader, StatsWriter, Uploader};
use blockfab_proto::{Command, RequestHeader};
use blockfab_transport::{rtt_timeout, BlockConnection};

use crate::cli::CowCmd;

/// Origin reads over the live server connection.
struct NetOrigin {
    conn: Mutex<BlockConnection>,
}

impl OriginReader for NetOrigin {
    async fn read_at(&self, offset: u64, len: u32) -> std::io::Result<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        let request = RequestHeader::get_block(offset, offset, len);
        conn.send_request(&request, None)
            .await
            .map_err(std::io::Error::other)?;
        let reply = conn.read_reply().await.map_err(std::io::Error::other)?;
        if reply.command != Command::GetBlock || reply.size != len {
            return Err(std::io::Error::other("unexpected origin reply"));
        }
        let mut data = vec![0u8; len as usize];
        conn.read_payload(&mut data)
            .await
            .map_err(std::io::Error::other)?;
        Ok(data)
    }
}

pub async fn run(cmd: CowCmd) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = BlockConnection::connect(cmd.server, rtt_timeout(0)).await?;
    let select = conn.select_image(&cmd.image, cmd.rid, false).await?;
    info!(
        "origin exports {}:{} ({} bytes)",
        select.name, select.rid, select.file_size
    );

    std::fs::create_dir_all(&cmd.cow_dir)?;
    let store = if cmd.load {
        Arc::new(CowStore::load(&cmd.cow_dir)?)
    } else {
        Arc::new(CowStore::create(
            &cmd.cow_dir,
            &select.name,
            select.rid,
            select.file_size,
        )?)
    };

    let uploader = Uploader::new(
        store.clone(),
        UploadConfig {
            server_url: cmd.upload_url.clone(),
            start_merge: cmd.merge,
        },
    );
    if store.uuid().is_empty() {
        uploader.create_session().await?;
    }
    let upload_task = uploader.spawn();
    StatsWriter::new(uploader.clone(), &cmd.cow_dir)?.spawn();

    let origin = NetOrigin { conn: Mutex::new(conn) };
    let file = CowFile::new(store, origin);
    // Exercise the full remote read path once before declaring the overlay
    // usable
    let probe = file.read(0, 4096).await?;
    info!(
        "overlay ready in {} (probe read {} bytes); ctrl-c detaches and drains",
        cmd.cow_dir.display(),
        probe.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("detaching, uploading remaining blocks");
    uploader.stop();
    upload_task.await?;
    info!("overlay drained");
    Ok(())
}
