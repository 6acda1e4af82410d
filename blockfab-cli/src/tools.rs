use log::info;

use blockfab_server::{CrcList, Image};

use crate::cli::{CrcCmd, CreateCmd};

pub fn generate_crc(cmd: CrcCmd) -> Result<(), Box<dyn std::error::Error>> {
    let list = CrcList::generate(&cmd.image)?;
    let mut sidecar = cmd.image.clone().into_os_string();
    sidecar.push(".crc");
    let sidecar = std::path::PathBuf::from(sidecar);
    list.save(&sidecar)?;
    info!(
        "wrote {} chunk checksum(s) to {}",
        list.chunks(),
        sidecar.display()
    );
    Ok(())
}

pub fn create_image(cmd: CreateCmd) -> Result<(), Box<dyn std::error::Error>> {
    let path = cmd
        .base_path
        .join(format!("{}.r{}", cmd.image, cmd.revision));
    Image::create(&path, &cmd.image, cmd.revision, cmd.size, true)?;
    info!("created {} with a zeroed cache map", path.display());
    Ok(())
}
