use std::path::PathBuf;

use http::StatusCode;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::codec::href_encode;
use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339, MemBuffer};

struct Resource {
    url: String,
    abs: PathBuf,
    meta: std::fs::Metadata,
    depth: usize,
}

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_propfind(&self, req: &Request) -> HttpResult<Response> {
        let depth = match req.header("depth").map(str::trim) {
            None => {
                return Err(HttpError::Message(
                    StatusCode::BAD_REQUEST,
                    "Missing 'Depth' header".to_string(),
                ))
            }
            Some("0") => 0,
            Some("1") => 1,
            Some(d) if d.eq_ignore_ascii_case("infinity") => usize::MAX,
            Some(_) => {
                return Err(HttpError::Message(
                    StatusCode::BAD_REQUEST,
                    "Unsupported 'Depth' header".to_string(),
                ))
            }
        };

        let path = self.resolve(req)?;
        let meta = self
            .metadata_opt(&path)
            .await
            .ok_or(HttpError::Status(StatusCode::NOT_FOUND))?;
        self.inner.root.check_path(&path, meta.is_dir())?;

        // Collect the target plus its visible descendants, bounded by
        // the requested depth.
        let mut url = req.path().to_string();
        if meta.is_dir() && !url.ends_with('/') {
            url.push('/');
        }
        let mut resources = Vec::new();
        let mut stack = vec![Resource {
            url,
            abs: path,
            meta,
            depth,
        }];
        while let Some(res) = stack.pop() {
            let recurse = res.meta.is_dir() && res.depth > 0;
            if recurse {
                let mut entries = tokio::fs::read_dir(&res.abs).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let abs = entry.path();
                    let Ok(meta) = tokio::fs::metadata(&abs).await else {
                        continue;
                    };
                    if !self.inner.root.policy().allows(&name, meta.is_dir()) {
                        continue;
                    }
                    let url = if meta.is_dir() {
                        format!("{}{}/", res.url, name)
                    } else {
                        format!("{}{}", res.url, name)
                    };
                    stack.push(Resource {
                        url,
                        abs,
                        meta,
                        depth: res.depth.saturating_sub(1),
                    });
                }
            }
            resources.push(res);
        }

        let mut buffer = MemBuffer::new();
        let mut writer = EmitterConfig::new().create_writer(&mut buffer);
        writer.write(XmlEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
        for res in &resources {
            write_resource(&mut writer, res)?;
        }
        writer.write(XmlEvent::end_element())?;
        drop(writer);

        let mut response =
            Response::with_data(buffer.take(), "application/xml; charset=\"utf-8\"");
        response.set_status(StatusCode::MULTI_STATUS);
        Ok(response)
    }
}

fn write_resource<W: std::io::Write>(
    w: &mut EventWriter<W>,
    res: &Resource,
) -> Result<(), xml::writer::Error> {
    w.write(XmlEvent::start_element("D:response"))?;
    text_element(w, "D:href", &href_encode(&res.url))?;
    w.write(XmlEvent::start_element("D:propstat"))?;
    w.write(XmlEvent::start_element("D:prop"))?;

    if let Ok(modified) = res.meta.modified() {
        text_element(w, "D:getlastmodified", &systemtime_to_httpdate(modified))?;
    }
    let created = res.meta.created().or_else(|_| res.meta.modified());
    if let Ok(created) = created {
        text_element(w, "D:creationdate", &systemtime_to_rfc3339(created))?;
    }
    if res.meta.is_dir() {
        w.write(XmlEvent::start_element("D:resourcetype"))?;
        w.write(XmlEvent::start_element("D:collection"))?;
        w.write(XmlEvent::end_element())?;
        w.write(XmlEvent::end_element())?;
    } else {
        w.write(XmlEvent::start_element("D:resourcetype"))?;
        w.write(XmlEvent::end_element())?;
        text_element(w, "D:getcontentlength", &res.meta.len().to_string())?;
        let mime = mime_guess::from_path(&res.abs)
            .first_raw()
            .unwrap_or("application/octet-stream");
        text_element(w, "D:getcontenttype", mime)?;
    }

    w.write(XmlEvent::end_element())?; // prop
    text_element(w, "D:status", "HTTP/1.1 200 OK")?;
    w.write(XmlEvent::end_element())?; // propstat
    w.write(XmlEvent::end_element())?; // response
    Ok(())
}

fn text_element<W: std::io::Write>(
    w: &mut EventWriter<W>,
    name: &str,
    value: &str,
) -> Result<(), xml::writer::Error> {
    w.write(XmlEvent::start_element(name))?;
    w.write(XmlEvent::characters(value))?;
    w.write(XmlEvent::end_element())?;
    Ok(())
}
