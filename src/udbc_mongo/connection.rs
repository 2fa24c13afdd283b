use async_trait::async_trait;
use bson::{Document, doc};
use futures::TryStreamExt;
use mongodb::Client;
use mongodb::options::{
    FindOneAndReplaceOptions, FindOneAndUpdateOptions, ReplaceOptions,
    UpdateOptions,
};

use crate::error::DriverError;
use crate::udbc::{DriverHandle, Namespace, Query, Write, WriteOutcome};
use crate::udbc_mongo::codec::{
    from_mongo_error, list_collections_command, list_indexes_command, to_find_options,
    to_return_document,
};

pub struct MongoHandle {
    client: Client,
    /// Database pinged by the liveness probe.
    database: String,
}

impl MongoHandle {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    fn collection(&self, ns: &Namespace) -> mongodb::Collection<Document> {
        self.client.database(&ns.db).collection::<Document>(&ns.collection)
    }

    async fn run(&self, db: &str, command: Document) -> Result<Document, DriverError> {
        self.client
            .database(db)
            .run_command(command)
            .await
            .map_err(from_mongo_error)
    }

    /// Runs a cursor-returning command and drains every batch.
    async fn cursor(&self, db: &str, command: Document) -> Result<Vec<Document>, DriverError> {
        let cursor = self
            .client
            .database(db)
            .run_cursor_command(command)
            .await
            .map_err(from_mongo_error)?;
        cursor.try_collect().await.map_err(from_mongo_error)
    }
}

fn update_options(upsert: bool) -> UpdateOptions {
    let mut options = UpdateOptions::default();
    options.upsert = Some(upsert);
    options
}

#[async_trait]
impl DriverHandle for MongoHandle {
    async fn query(&self, ns: &Namespace, query: Query) -> Result<Vec<Document>, DriverError> {
        match query {
            Query::Find { filter, options } => {
                let cursor = self
                    .collection(ns)
                    .find(filter)
                    .with_options(to_find_options(options))
                    .await
                    .map_err(from_mongo_error)?;
                cursor.try_collect().await.map_err(from_mongo_error)
            }
            Query::Aggregate { pipeline } => {
                let cursor = self
                    .collection(ns)
                    .aggregate(pipeline)
                    .await
                    .map_err(from_mongo_error)?;
                cursor.try_collect().await.map_err(from_mongo_error)
            }
            Query::ListIndexes => self.cursor(&ns.db, list_indexes_command(ns)).await,
            Query::ListCollections { filter } => {
                self.cursor(&ns.db, list_collections_command(filter)).await
            }
        }
    }

    async fn write(&self, ns: &Namespace, write: Write) -> Result<WriteOutcome, DriverError> {
        let coll = self.collection(ns);
        let mut outcome = WriteOutcome::default();
        match write {
            Write::InsertOne { document } => {
                let result = coll.insert_one(document).await.map_err(from_mongo_error)?;
                outcome.inserted_ids.push(result.inserted_id);
            }
            Write::InsertMany { documents } => {
                let result = coll.insert_many(documents).await.map_err(from_mongo_error)?;
                let mut ids: Vec<_> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(index, _)| *index);
                outcome.inserted_ids = ids.into_iter().map(|(_, id)| id).collect();
            }
            Write::UpdateOne { filter, update, upsert } => {
                let result = coll
                    .update_one(filter, update)
                    .with_options(update_options(upsert))
                    .await
                    .map_err(from_mongo_error)?;
                outcome.matched = result.matched_count;
                outcome.modified = result.modified_count;
                outcome.upserted_id = result.upserted_id;
            }
            Write::UpdateMany { filter, update, upsert } => {
                let result = coll
                    .update_many(filter, update)
                    .with_options(update_options(upsert))
                    .await
                    .map_err(from_mongo_error)?;
                outcome.matched = result.matched_count;
                outcome.modified = result.modified_count;
                outcome.upserted_id = result.upserted_id;
            }
            Write::ReplaceOne { filter, replacement, upsert } => {
                let mut options = ReplaceOptions::default();
                options.upsert = Some(upsert);
                let result = coll
                    .replace_one(filter, replacement)
                    .with_options(options)
                    .await
                    .map_err(from_mongo_error)?;
                outcome.matched = result.matched_count;
                outcome.modified = result.modified_count;
                outcome.upserted_id = result.upserted_id;
            }
            Write::DeleteOne { filter } => {
                let result = coll.delete_one(filter).await.map_err(from_mongo_error)?;
                outcome.deleted = result.deleted_count;
            }
            Write::DeleteMany { filter } => {
                let result = coll.delete_many(filter).await.map_err(from_mongo_error)?;
                outcome.deleted = result.deleted_count;
            }
            Write::FindOneAndUpdate { filter, update, upsert, return_document } => {
                let mut options = FindOneAndUpdateOptions::default();
                options.upsert = Some(upsert);
                options.return_document = Some(to_return_document(return_document));
                outcome.document = coll
                    .find_one_and_update(filter, update)
                    .with_options(options)
                    .await
                    .map_err(from_mongo_error)?;
            }
            Write::FindOneAndReplace { filter, replacement, upsert, return_document } => {
                let mut options = FindOneAndReplaceOptions::default();
                options.upsert = Some(upsert);
                options.return_document = Some(to_return_document(return_document));
                outcome.document = coll
                    .find_one_and_replace(filter, replacement)
                    .with_options(options)
                    .await
                    .map_err(from_mongo_error)?;
            }
            Write::FindOneAndDelete { filter } => {
                outcome.document = coll
                    .find_one_and_delete(filter)
                    .await
                    .map_err(from_mongo_error)?;
            }
        }
        Ok(outcome)
    }

    async fn command(&self, db: &str, command: Document) -> Result<Document, DriverError> {
        self.run(db, command).await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.run(&self.database, doc! { "ping": 1 }).await.map(|_| ())
    }
}
