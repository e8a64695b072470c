use crate::daemon::records::LocationRecord;
use crate::util::logging::info;
use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::{doc, from_document, oid::ObjectId, to_document, Bson, Document};
use mongodb::{Client, Collection, IndexModel};

const LOCATIONS_COLLECTION: &str = "locations";
const TRIPS_COLLECTION: &str = "trips";

/// Append-only gateway to the durable store. Insertions assign ids in
/// place so callers can broadcast exactly what was persisted.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Bulk-insert a batch, preserving order. All-or-nothing from the
    /// caller's perspective: on error none of the batch may be
    /// considered persisted.
    async fn insert_locations(&self, locations: &mut [LocationRecord]) -> Result<()>;

    /// Trip markers land in their own collection, at most one per
    /// ingestion call.
    async fn insert_trip(&self, trip: &mut LocationRecord) -> Result<()>;

    /// Most recent record by `properties.timestamp`, if any.
    async fn latest_location(&self) -> Result<Option<LocationRecord>>;
}

pub struct MongoStore {
    client: Client,
    database: String,
}

impl MongoStore {
    /// The driver connects lazily; a bad URL fails here, an
    /// unreachable server fails the first operation instead.
    pub async fn connect(url: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(url)
            .await
            .with_context(|| format!("connect to {url}"))?;
        Ok(Self {
            client,
            database: database.to_string(),
        })
    }

    fn locations(&self) -> Collection<Document> {
        self.client
            .database(&self.database)
            .collection(LOCATIONS_COLLECTION)
    }

    fn trips(&self) -> Collection<Document> {
        self.client
            .database(&self.database)
            .collection(TRIPS_COLLECTION)
    }

    /// Create the descending timestamp index backing `latest_location`.
    /// Run once at startup; safe to call repeatedly.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { "properties.timestamp": -1 })
            .build();
        self.locations()
            .create_index(index)
            .await
            .context("create locations timestamp index")?;
        info!("locations timestamp index ensured");
        Ok(())
    }
}

fn assign_id(record: &mut LocationRecord) {
    if record.id.is_none() {
        record.id = Some(ObjectId::new().to_hex());
    }
}

fn to_doc(record: &LocationRecord) -> Result<Document> {
    to_document(record).context("encode location record")
}

fn from_doc(mut doc: Document) -> Result<LocationRecord> {
    let id = match doc.remove("_id") {
        Some(Bson::ObjectId(oid)) => Some(oid.to_hex()),
        Some(Bson::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    };
    let mut record: LocationRecord = from_document(doc).context("decode location record")?;
    record.id = id;
    Ok(record)
}

#[async_trait]
impl LocationStore for MongoStore {
    async fn insert_locations(&self, locations: &mut [LocationRecord]) -> Result<()> {
        if locations.is_empty() {
            return Ok(());
        }
        let docs = locations
            .iter_mut()
            .map(|record| {
                assign_id(record);
                to_doc(record)
            })
            .collect::<Result<Vec<_>>>()?;
        self.locations()
            .insert_many(docs)
            .await
            .context("bulk insert locations")?;
        Ok(())
    }

    async fn insert_trip(&self, trip: &mut LocationRecord) -> Result<()> {
        assign_id(trip);
        self.trips()
            .insert_one(to_doc(trip)?)
            .await
            .context("insert trip")?;
        Ok(())
    }

    async fn latest_location(&self) -> Result<Option<LocationRecord>> {
        let found = self
            .locations()
            .find_one(doc! {})
            .sort(doc! { "properties.timestamp": -1 })
            .await
            .context("fetch latest location")?;
        found.map(from_doc).transpose()
    }
}
