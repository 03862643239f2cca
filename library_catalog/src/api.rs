use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Deserializer, Serialize};

pub type BookId = String;

/// Book metadata as stored in the catalog.
///
/// Older catalog documents were written with Portuguese field names
/// (`titulo`, `autor`, `capa`, `paginas`) or with the Google Books names
/// (`thumbnail`, `imageUrl`, `pageCount`); all of them are accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookMeta {
    #[serde(alias = "titulo")]
    pub title: String,
    #[serde(default, alias = "autor")]
    pub author: String,
    #[serde(default, alias = "capa", alias = "thumbnail", alias = "imageUrl")]
    pub cover: String,
    #[serde(
        default,
        alias = "paginas",
        alias = "pageCount",
        deserialize_with = "deserialize_page_count"
    )]
    pub pages: Option<u32>,
    #[serde(default, alias = "descricao")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookMetaPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookTitleAndId {
    pub book_id: BookId,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct GetAllBooksResponse {
    pub books: Vec<BookTitleAndId>,
}

/// Page counts show up both as numbers and as numeric strings ("320").
fn deserialize_page_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPageCount {
        Number(u32),
        Text(String),
    }

    Ok(
        match Option::<RawPageCount>::deserialize(deserializer)? {
            Some(RawPageCount::Number(pages)) => Some(pages),
            Some(RawPageCount::Text(text)) => text.trim().parse().ok(),
            None => None,
        }
        .filter(|pages| *pages > 0),
    )
}
