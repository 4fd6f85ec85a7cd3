//! Test fixtures: feed documents and state files

/// RSS feed with two items, the first carrying an image enclosure
pub const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Wire</title>
    <link>https://wire.example.com</link>
    <item>
      <title>Central bank holds rates steady</title>
      <link>https://wire.example.com/a/1001</link>
      <description>&lt;p&gt;The committee voted &lt;b&gt;unanimously&lt;/b&gt;.&lt;/p&gt;</description>
      <enclosure url="IMAGE_URL" type="image/jpeg" length="4096"/>
    </item>
    <item>
      <title>Harbour bridge reopens after repairs</title>
      <link>https://wire.example.com/a/1002</link>
      <description>Traffic resumed on Monday morning.</description>
    </item>
  </channel>
</rss>"#;

/// Same feed one poll later: one old item, one new
pub const SAMPLE_RSS_NEXT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Wire</title>
    <item>
      <title>Harbour bridge reopens after repairs</title>
      <link>https://wire.example.com/a/1002</link>
      <description>Traffic resumed on Monday morning.</description>
    </item>
    <item>
      <title>Museum unveils restored mural</title>
      <link>https://wire.example.com/a/1003</link>
      <description>The work took three years.</description>
    </item>
  </channel>
</rss>"#;

/// Feed with the image URL pointed at `base`
pub fn rss_with_image(base: &str) -> String {
    SAMPLE_RSS.replace("IMAGE_URL", &format!("{base}/img/1001.jpg"))
}

/// Feed whose only image sits in the first item's description HTML
pub fn rss_with_inline_image(base: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Wire</title>
    <item>
      <title>Museum unveils restored mural</title>
      <link>https://wire.example.com/a/1003</link>
      <description>&lt;img src="{base}/static/icon.png"&gt;&lt;p&gt;The work took three years.&lt;/p&gt;&lt;img src="{base}/img/1003.jpg"&gt;</description>
    </item>
    <item>
      <title>Harbour bridge reopens after repairs</title>
      <link>https://wire.example.com/a/1002</link>
      <description>Traffic resumed on Monday morning.</description>
    </item>
  </channel>
</rss>"#
    )
}

/// Legacy state document: list-shaped entries and a flat hash list
pub const LEGACY_STATE: &str = r#"{
  "sent_entries": [
    {"post_id": "legacy-one", "pub_date": "2023-11-02T08:00:00"},
    "legacy-two"
  ],
  "entry_hashes": [
    "0000000000000000000000000000000000000000000000000000000000000001"
  ],
  "stats": {"posts_sent": 7}
}"#;

/// Bytes that are not JSON at all
pub const CORRUPT_STATE: &str = "{\"sent_entries\": {\"abc\": ";

/// Minimal JPEG-like payload above the minimum image size
pub fn image_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.resize(4096, 0x42);
    bytes
}
