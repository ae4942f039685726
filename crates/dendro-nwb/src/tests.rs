use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::{Array3, Ix3};
use serde_json::{json, Map, Value};

use crate::errors::NwbError;
use crate::lindi::LindiFile;
use crate::memory::MemoryFile;
use crate::model::{AxisSelection, HierarchicalFile, Hyperslab};
use crate::remote::{BytesFile, FileOpener, HttpRangeFile, RemoteFile, UrlOpener};

struct MapOpener(HashMap<String, Vec<u8>>);

impl FileOpener for MapOpener {
    fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, NwbError> {
        self.0
            .get(url)
            .map(|bytes| Box::new(BytesFile::new(url, bytes.clone())) as Box<dyn RemoteFile>)
            .ok_or_else(|| NwbError::UnsupportedUrl {
                url: url.to_string(),
                reason: "not registered".to_string(),
            })
    }
}

fn value_at(t: usize, x: usize, y: usize) -> f32 {
    (t * 100 + x * 10 + y) as f32
}

fn f32_le_chunk(times: std::ops::Range<usize>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for t in times {
        for x in 0..2 {
            for y in 0..3 {
                bytes.extend_from_slice(&value_at(t, x, y).to_le_bytes());
            }
        }
    }
    bytes
}

fn two_photon_document(with_second_chunk: bool) -> Value {
    let mut refs = json!({
        ".zgroup": {"zarr_format": 2},
        "acquisition/.zgroup": {"zarr_format": 2},
        "acquisition/TwoPhotonSeries/.zgroup": {"zarr_format": 2},
        "acquisition/TwoPhotonSeries/.zattrs": {
            "neurodata_type": "TwoPhotonSeries",
            "namespace": "core",
            "rate": 30.0
        },
        "acquisition/TwoPhotonSeries/data/.zarray": json!({
            "shape": [4, 2, 3],
            "chunks": [2, 2, 3],
            "dtype": "<f4",
            "fill_value": 7.0,
            "order": "C",
            "compressor": null,
            "filters": null,
            "zarr_format": 2
        }).to_string(),
        "acquisition/TwoPhotonSeries/data/0.0.0":
            format!("base64:{}", STANDARD.encode(f32_le_chunk(0..2))),
        "acquisition/TwoPhotonSeries/description/.zarray": {
            "shape": [],
            "chunks": [],
            "dtype": "|O",
            "fill_value": null,
            "order": "C",
            "compressor": null,
            "filters": null,
            "zarr_format": 2
        }
    });
    if with_second_chunk {
        refs["acquisition/TwoPhotonSeries/data/1.0.0"] = json!(["{{u1}}", 8, 48]);
    }
    json!({
        "refs": refs,
        "templates": {"u1": "blob://movie"},
        "generation": 1
    })
}

fn movie_opener() -> Box<dyn FileOpener> {
    let mut payload = vec![0xAAu8; 8];
    payload.extend(f32_le_chunk(2..4));
    Box::new(MapOpener(HashMap::from([("blob://movie".to_string(), payload)])))
}

fn open_document(document: &Value) -> LindiFile {
    let bytes = serde_json::to_vec(document).expect("serialize document");
    LindiFile::from_slice("memory://test.lindi.json", &bytes, movie_opener())
        .expect("document should index")
}

#[test]
fn indexes_groups_datasets_and_attributes() {
    let file = open_document(&two_photon_document(true));

    let series = file
        .node("/acquisition/TwoPhotonSeries")
        .expect("series group present");
    assert!(series.is_group());
    assert_eq!(series.neurodata_type(), Some("TwoPhotonSeries"));
    assert_eq!(series.attribute_f64("rate"), Some(30.0));

    let data = file
        .node("acquisition/TwoPhotonSeries/data")
        .and_then(|node| node.dataset())
        .expect("data dataset present");
    assert_eq!(data.shape, vec![4, 2, 3]);
    assert!(data.numeric_dtype().is_some());

    let description = file
        .node("acquisition/TwoPhotonSeries/description")
        .and_then(|node| node.dataset())
        .expect("text dataset is still listed");
    assert!(description.numeric_dtype().is_none());

    let paths: Vec<&str> = file.nodes().iter().map(|node| node.path.as_str()).collect();
    assert_eq!(paths.first(), Some(&""));
}

#[test]
fn reads_hyperslab_across_inline_and_external_chunks() {
    let file = open_document(&two_photon_document(true));
    let selection = Hyperslab::new(vec![
        AxisSelection::Indices(vec![3, 0]),
        AxisSelection::Range(0..2),
        AxisSelection::Range(1..3),
    ]);

    let movie = file
        .read("acquisition/TwoPhotonSeries/data", &selection)
        .expect("read succeeds")
        .into_dimensionality::<Ix3>()
        .expect("three dimensional");

    assert_eq!(movie.dim(), (2, 2, 2));
    assert_eq!(movie[[0, 1, 0]], value_at(3, 1, 1) as f64);
    assert_eq!(movie[[1, 0, 1]], value_at(0, 0, 2) as f64);
}

#[test]
fn unwritten_chunks_take_the_fill_value() {
    let file = open_document(&two_photon_document(false));
    let movie = file
        .read("acquisition/TwoPhotonSeries/data", &Hyperslab::all(3))
        .expect("read succeeds")
        .into_dimensionality::<Ix3>()
        .expect("three dimensional");

    assert_eq!(movie[[1, 1, 2]], value_at(1, 1, 2) as f64);
    assert!(movie.slice(ndarray::s![2.., .., ..]).iter().all(|&v| v == 7.0));
}

#[test]
fn out_of_range_indices_are_rejected() {
    let file = open_document(&two_photon_document(true));
    let selection = Hyperslab::new(vec![
        AxisSelection::Indices(vec![4]),
        AxisSelection::All,
        AxisSelection::All,
    ]);
    let err = file
        .read("acquisition/TwoPhotonSeries/data", &selection)
        .unwrap_err();
    assert!(matches!(err, NwbError::Selection { .. }));
}

fn compress(codec: &str, raw: &[u8]) -> Vec<u8> {
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    match codec {
        "zlib" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(raw).expect("compress");
            encoder.finish().expect("finish")
        }
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(raw).expect("compress");
            encoder.finish().expect("finish")
        }
        other => panic!("no encoder for {other}"),
    }
}

fn compressed_document(compressor: Value, filters: Value, chunk: &[u8]) -> Vec<u8> {
    let document = json!({
        "refs": {
            "data/.zarray": {
                "shape": [4],
                "chunks": [2],
                "dtype": "<i2",
                "fill_value": 0,
                "order": "C",
                "compressor": compressor,
                "filters": filters,
                "zarr_format": 2
            },
            "data/0": format!("base64:{}", STANDARD.encode(chunk))
        }
    });
    serde_json::to_vec(&document).expect("serialize")
}

#[test]
fn zlib_and_gzip_chunks_are_decompressed() {
    let mut raw = Vec::new();
    for value in [-3i16, 1200] {
        raw.extend_from_slice(&value.to_le_bytes());
    }

    for codec in ["zlib", "gzip"] {
        let bytes = compressed_document(json!({"id": codec, "level": 4}), Value::Null, &compress(codec, &raw));
        let file = LindiFile::from_slice("memory://compressed", &bytes, movie_opener()).expect("index");
        let data = file.read("data", &Hyperslab::all(1)).expect(codec);
        let values: Vec<f64> = data.iter().copied().collect();
        // The second chunk is unwritten and takes the fill value.
        assert_eq!(values, vec![-3.0, 1200.0, 0.0, 0.0], "{codec}");
    }
}

#[test]
fn unsupported_codecs_and_filters_are_reported() {
    let bytes = compressed_document(json!({"id": "blosc", "cname": "lz4"}), Value::Null, &[0; 4]);
    let file = LindiFile::from_slice("memory://blosc", &bytes, movie_opener()).expect("index");
    let err = file.read("data", &Hyperslab::all(1)).unwrap_err();
    assert!(matches!(err, NwbError::UnsupportedLayout { reason, .. } if reason.contains("blosc")));

    let bytes = compressed_document(
        json!({"id": "zlib", "level": 4}),
        json!([{"id": "shuffle", "elementsize": 2}]),
        &compress("zlib", &[0; 4]),
    );
    let file = LindiFile::from_slice("memory://shuffle", &bytes, movie_opener()).expect("index");
    let err = file.read("data", &Hyperslab::all(1)).unwrap_err();
    assert!(matches!(err, NwbError::UnsupportedLayout { reason, .. } if reason.contains("shuffle")));
}

#[test]
fn corrupt_compressed_chunk_is_a_chunk_error() {
    let bytes = compressed_document(json!({"id": "zlib"}), Value::Null, b"not zlib at all");
    let file = LindiFile::from_slice("memory://corrupt", &bytes, movie_opener()).expect("index");
    let err = file.read("data", &Hyperslab::all(1)).unwrap_err();
    assert!(matches!(err, NwbError::Chunk { key, .. } if key == "data/0"));
}

#[test]
fn decodes_big_endian_integers_with_slash_separator() {
    let mut payload = Vec::new();
    for value in [-2i16, 5, 300, -400] {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    let document = json!({
        "refs": {
            "grid/.zarray": {
                "shape": [2, 2],
                "chunks": [1, 2],
                "dtype": ">i2",
                "fill_value": 0,
                "order": "C",
                "compressor": null,
                "filters": null,
                "dimension_separator": "/",
                "zarr_format": 2
            },
            "grid/0/0": format!("base64:{}", STANDARD.encode(&payload[..4])),
            "grid/1/0": format!("base64:{}", STANDARD.encode(&payload[4..]))
        }
    });
    let bytes = serde_json::to_vec(&document).expect("serialize");
    let file = LindiFile::from_slice("memory://grid", &bytes, movie_opener()).expect("index");
    let grid = file.read("grid", &Hyperslab::all(2)).expect("read");
    let values: Vec<f64> = grid.iter().copied().collect();
    assert_eq!(values, vec![-2.0, 5.0, 300.0, -400.0]);
}

#[test]
fn opens_documents_from_local_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blob_path = dir.path().join("movie.bin");
    let mut blob = vec![0u8; 8];
    blob.extend(f32_le_chunk(2..4));
    std::fs::write(&blob_path, blob).expect("write blob");

    let mut document = two_photon_document(true);
    document["templates"]["u1"] = json!(blob_path.to_string_lossy());
    let doc_path = dir.path().join("session.nwb.lindi.json");
    std::fs::write(&doc_path, serde_json::to_vec(&document).expect("serialize")).expect("write");

    let url = format!("file://{}", doc_path.display());
    let file = LindiFile::open(&url).expect("open local document");
    let movie = file
        .read("acquisition/TwoPhotonSeries/data", &Hyperslab::all(3))
        .expect("read");
    assert_eq!(movie.shape(), &[4, 2, 3]);
    assert_eq!(movie.iter().last().copied(), Some(value_at(3, 1, 2) as f64));
}

#[test]
fn memory_file_reads_index_selections() {
    let data = Array3::from_shape_fn((3, 2, 2), |(t, x, y)| (t * 100 + x * 10 + y) as f64).into_dyn();
    let mut attrs = Map::new();
    attrs.insert("neurodata_type".into(), json!("TwoPhotonSeries"));
    let file = MemoryFile::new("memory://session")
        .with_group("/acquisition/Series", attrs)
        .with_dataset("/acquisition/Series/data", data, Map::new());

    assert!(file.node("acquisition").is_some_and(|node| node.is_group()));

    let selection = Hyperslab::new(vec![
        AxisSelection::Indices(vec![2, 2]),
        AxisSelection::All,
        AxisSelection::Range(1..2),
    ]);
    let out = file
        .read("acquisition/Series/data", &selection)
        .expect("read")
        .into_dimensionality::<Ix3>()
        .expect("3d");
    assert_eq!(out.dim(), (2, 2, 1));
    assert_eq!(out[[1, 1, 0]], 211.0);

    assert!(matches!(
        file.read("acquisition/Series", &selection),
        Err(NwbError::NotADataset(_))
    ));
}

/// Single-threaded HTTP/1.1 server answering HEAD, GET and single `Range` requests.
fn serve(listener: TcpListener, routes: HashMap<String, Vec<u8>>) {
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let _ = respond(stream, &routes);
        }
    });
}

fn respond(mut stream: TcpStream, routes: &HashMap<String, Vec<u8>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut range: Option<(usize, usize)> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = value
                    .trim()
                    .strip_prefix("bytes=")
                    .and_then(|spec| spec.split_once('-'))
                    .and_then(|(first, last)| Some((first.parse().ok()?, last.parse().ok()?)));
            }
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let Some(body) = routes.get(path) else {
        return stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    };

    let (status, payload, content_range) = match range {
        Some((first, last)) if first < body.len() => {
            let last = last.min(body.len() - 1);
            (
                "206 Partial Content",
                &body[first..=last],
                format!("Content-Range: bytes {first}-{last}/{}\r\n", body.len()),
            )
        }
        Some(_) => (
            "416 Range Not Satisfiable",
            &body[..0],
            format!("Content-Range: bytes */{}\r\n", body.len()),
        ),
        None => ("200 OK", &body[..], String::new()),
    };
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{content_range}Connection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes())?;
    if method != "HEAD" {
        stream.write_all(payload)?;
    }
    stream.flush()
}

fn direct_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .expect("http client")
}

#[test]
fn reads_documents_and_chunks_over_http() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("address"));

    let mut blob = vec![0xAAu8; 8];
    blob.extend(f32_le_chunk(2..4));
    let mut document = two_photon_document(true);
    document["templates"]["u1"] = json!(format!("{base}/blobs/movie"));
    serve(
        listener,
        HashMap::from([
            ("/blobs/movie".to_string(), blob),
            (
                "/session.nwb.lindi.json".to_string(),
                serde_json::to_vec(&document).expect("serialize"),
            ),
        ]),
    );

    let opener = UrlOpener::with_client(direct_client());
    let source = opener
        .open(&format!("{base}/session.nwb.lindi.json"))
        .expect("http source");
    let file = LindiFile::from_remote(source.as_ref(), Box::new(opener)).expect("index");
    let movie = file
        .read("acquisition/TwoPhotonSeries/data", &Hyperslab::all(3))
        .expect("read");
    assert_eq!(movie.shape(), &[4, 2, 3]);
    assert_eq!(movie[[3, 1, 2]], value_at(3, 1, 2) as f64);
    assert_eq!(movie[[0, 0, 1]], value_at(0, 0, 1) as f64);

    let remote = HttpRangeFile::with_client(&format!("{base}/blobs/movie"), direct_client())
        .expect("http url");
    assert_eq!(remote.size().expect("size"), 56);
    assert_eq!(
        remote.read_range(8, 4).expect("range"),
        value_at(2, 0, 0).to_le_bytes().to_vec()
    );
    assert!(matches!(
        remote.read_range(54, 4),
        Err(NwbError::RangeOutOfBounds { size: 56, .. })
    ));

    let missing = HttpRangeFile::with_client(&format!("{base}/blobs/absent"), direct_client())
        .expect("http url");
    assert!(matches!(missing.read_range(0, 4), Err(NwbError::Http { .. })));
}
