use crate::areas::refs::HEAD_REF_NAME;
use crate::areas::repository::Repository;
use crate::artifacts::objects::object_id::ObjectId;
use crate::protocol::error::ProtocolResult;
use crate::protocol::pkt_line::PktLineWriter;
use crate::protocol::{AGENT, Service};

const UPLOAD_PACK_CAPABILITIES: &[&str] = &["side-band-64k", "ofs-delta", "no-progress"];
const RECEIVE_PACK_CAPABILITIES: &[&str] = &["report-status", "delete-refs", "side-band-64k", "ofs-delta"];

/// Refs as advertised: HEAD first (upload-pack only), then `refs/...` by name.
pub fn advertised_refs(repository: &Repository, service: Service) -> ProtocolResult<Vec<(String, ObjectId)>> {
    let refs = repository.refs();
    let mut advertised = Vec::new();

    if service == Service::UploadPack
        && let Some(head) = refs.read_head()?
    {
        advertised.push((HEAD_REF_NAME.to_string(), head));
    }
    advertised.extend(
        refs.list_refs()?
            .into_iter()
            .map(|(name, oid)| (name.to_string(), oid)),
    );

    Ok(advertised)
}

fn capabilities(repository: &Repository, service: Service) -> ProtocolResult<String> {
    let mut capabilities = match service {
        Service::UploadPack => UPLOAD_PACK_CAPABILITIES,
        Service::ReceivePack => RECEIVE_PACK_CAPABILITIES,
    }
    .iter()
    .map(|capability| capability.to_string())
    .collect::<Vec<_>>();

    if service == Service::UploadPack
        && let Some(target) = repository.refs().head_target()?
    {
        capabilities.push(format!("symref={HEAD_REF_NAME}:{target}"));
    }
    capabilities.push(AGENT.to_string());

    Ok(capabilities.join(" "))
}

/// Body of `info/refs?service=<service>`.
pub fn smart_advertisement(repository: &Repository, service: Service) -> ProtocolResult<Vec<u8>> {
    let mut writer = PktLineWriter::new(Vec::new());
    writer.write_line(&format!("# service={}", service.name()))?;
    writer.flush_pkt()?;

    let capabilities = capabilities(repository, service)?;
    let refs = advertised_refs(repository, service)?;

    if refs.is_empty() {
        writer.write_line(&format!("{} capabilities^{{}}\0{capabilities}", ObjectId::zero()))?;
    }
    for (index, (name, oid)) in refs.iter().enumerate() {
        if index == 0 {
            writer.write_line(&format!("{oid} {name}\0{capabilities}"))?;
        } else {
            writer.write_line(&format!("{oid} {name}"))?;
        }
    }
    writer.flush_pkt()?;

    Ok(writer.into_inner())
}

/// Body of a plain `info/refs` for dumb clients: `<oid>\t<ref>` per line.
pub fn dumb_advertisement(repository: &Repository) -> ProtocolResult<String> {
    Ok(repository
        .refs()
        .list_refs()?
        .into_iter()
        .map(|(name, oid)| format!("{oid}\t{name}\n"))
        .collect())
}
